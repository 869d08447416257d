use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::warn;

/// Message received from a chat channel. Media entries are URIs or
/// base64 data URIs, already resolved by the channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub current_dir: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Message to deliver back to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// In-process queues between channel adapters and the executor.
///
/// Queues are unbounded with an advisory high-water mark: crossing it
/// logs a warning but the publish succeeds. Publishing into a bus whose
/// consumer is gone returns an error the producer must tolerate.
/// Ordering is FIFO per `(channel, chat_id)`; nothing is guaranteed
/// across sessions.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    inbound_depth: Arc<AtomicUsize>,
    outbound_depth: Arc<AtomicUsize>,
    high_water: usize,
}

pub const DEFAULT_HIGH_WATER: usize = 1024;

impl MessageBus {
    pub fn new(high_water: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        MessageBus {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_depth: Arc::new(AtomicUsize::new(0)),
            outbound_depth: Arc::new(AtomicUsize::new(0)),
            high_water: high_water.max(1),
        }
    }

    pub fn publish_inbound(&self, msg: InboundMessage) -> Result<(), String> {
        let depth = self.inbound_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.high_water {
            warn!("inbound queue above high-water mark ({depth} > {})", self.high_water);
        }
        self.inbound_tx.send(msg).map_err(|_| {
            self.inbound_depth.fetch_sub(1, Ordering::Relaxed);
            "inbound queue closed".to_string()
        })
    }

    /// Blocks until a message is available or every producer is gone.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let msg = self.inbound_rx.lock().await.recv().await;
        if msg.is_some() {
            self.inbound_depth.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), String> {
        let depth = self.outbound_depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > self.high_water {
            warn!("outbound queue above high-water mark ({depth} > {})", self.high_water);
        }
        self.outbound_tx.send(msg).map_err(|_| {
            self.outbound_depth.fetch_sub(1, Ordering::Relaxed);
            "outbound queue closed".to_string()
        })
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let msg = self.outbound_rx.lock().await.recv().await;
        if msg.is_some() {
            self.outbound_depth.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn inbound_depth(&self) -> usize {
        self.inbound_depth.load(Ordering::Relaxed)
    }
}
