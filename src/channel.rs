use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::OutboundMessage;
use crate::error::WispError;

/// Contract implemented by concrete chat-channel adapters (Feishu, QQ,
/// …). The core only routes messages through this surface; adapters live
/// outside the runtime.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<(), WispError>;
    async fn stop(&self);
    async fn send(&self, msg: &OutboundMessage) -> Result<(), WispError>;
    fn is_running(&self) -> bool;
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            channels: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.channels.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.channels.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingAdapter {
        channel_name: String,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.channel_name
        }

        async fn start(&self) -> Result<(), WispError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send(&self, _msg: &OutboundMessage) -> Result<(), WispError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let adapter = Arc::new(RecordingAdapter {
            channel_name: "feishu".into(),
            sent: AtomicUsize::new(0),
        });
        let mut registry = ChannelRegistry::new();
        registry.register(adapter.clone());

        assert_eq!(registry.names(), vec!["feishu"]);
        let found = registry.get("feishu").unwrap();
        found
            .send(&OutboundMessage {
                channel: "feishu".into(),
                chat_id: "c1".into(),
                content: "hi".into(),
                media: vec![],
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(adapter.sent.load(Ordering::SeqCst), 1);
        assert!(registry.get("qq").is_none());
    }
}
