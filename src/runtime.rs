use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::bus::{MessageBus, OutboundMessage, DEFAULT_HIGH_WATER};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::embedding;
use crate::executor::process_message;
use crate::gateway::LlmGateway;
use crate::memory::MemoryService;
use crate::memory_store::MemoryStore;
use crate::migration::MigrationEngine;
use crate::router::{ModelRouter, RouterOptions};
use crate::sessions::SessionStore;
use crate::skills::SkillManager;
use crate::text::split_text;
use crate::tools::ToolRegistry;

/// Chat channels reject oversized payloads; replies are chunked before
/// they reach an adapter. The bound stays under the tightest common
/// platform limit (4096 chars).
const OUTBOUND_CHUNK_BYTES: usize = 4000;

/// Split an oversized reply into per-chunk messages, FIFO within the
/// session. Media rides on the first chunk only.
fn chunk_outbound(msg: OutboundMessage) -> Vec<OutboundMessage> {
    if msg.content.len() <= OUTBOUND_CHUNK_BYTES {
        return vec![msg];
    }
    split_text(&msg.content, OUTBOUND_CHUNK_BYTES)
        .into_iter()
        .enumerate()
        .map(|(i, content)| OutboundMessage {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            content,
            media: if i == 0 { msg.media.clone() } else { vec![] },
            metadata: msg.metadata.clone(),
        })
        .collect()
}

pub struct AppState {
    pub config: Config,
    pub gateway: LlmGateway,
    pub router: ModelRouter,
    pub tools: ToolRegistry,
    pub skills: SkillManager,
    pub sessions: SessionStore,
    pub memory: Option<Arc<MemoryService>>,
}

/// Wire the core together from config. Returns the shared state plus the
/// migration engine when an embedding model is configured.
pub fn build_state(config: Config) -> anyhow::Result<(Arc<AppState>, Option<Arc<MigrationEngine>>)> {
    let pool = config.model_pool();
    let gateway = LlmGateway::new(config.provider_entries(), &pool);
    let router = ModelRouter::new(
        pool,
        config.routing.rules.clone(),
        config.routing.weights.clone(),
        RouterOptions {
            auto: config.agents.auto && config.routing.enabled,
            max: config.agents.max,
            default_chat: config.agents.models.chat.clone(),
            intent_model: config.agents.models.intent.clone(),
        },
    );

    let workspace = Path::new(&config.agents.workspace);
    let tools = ToolRegistry::with_builtins(workspace);
    let skills = SkillManager::new(
        workspace
            .join("skills")
            .to_string_lossy()
            .as_ref(),
    );

    let mut memory = None;
    let mut migration = None;
    if config.memory.enabled {
        let embedder = embedding::create_provider(&config);
        let store = Arc::new(MemoryStore::open(
            Path::new(&config.memory.storage_path),
            embedder.as_ref().map(|e| e.model_key()),
        )?);
        let service = Arc::new(MemoryService::new(
            store.clone(),
            embedder.clone(),
            config.memory.search_limit,
            config.memory.multi_embed.max_models,
        ));
        if let Some(embedder) = embedder {
            if config.memory.multi_embed.enabled {
                let engine = Arc::new(MigrationEngine::new(
                    store,
                    embedder,
                    config.memory.multi_embed.batch_size,
                    config.memory.multi_embed.migrate_interval_ms,
                ));
                service.attach_migration(engine.shared_state());
                migration = Some(engine);
            }
        }
        memory = Some(service);
    }

    let state = Arc::new(AppState {
        config,
        gateway,
        router,
        tools,
        skills,
        sessions: SessionStore::default(),
        memory,
    });
    Ok((state, migration))
}

/// Run the core: executor worker over the bus, outbound dispatcher,
/// summarizer, retention sweep, and (when needed) the auto-migration —
/// until Ctrl-C.
pub async fn run(config: Config, channels: ChannelRegistry) -> anyhow::Result<()> {
    let (state, migration) = build_state(config)?;
    let bus = Arc::new(MessageBus::new(DEFAULT_HIGH_WATER));
    let channels = Arc::new(channels);
    let (stop_tx, stop_rx) = watch::channel(false);

    if channels.is_empty() {
        warn!("no channel adapters registered; the bus will stay idle");
    } else {
        info!("channels registered: {:?}", channels.names());
        for name in channels.names() {
            if let Some(adapter) = channels.get(&name) {
                adapter
                    .start()
                    .await
                    .map_err(|e| anyhow!("channel '{name}' failed to start: {e}"))?;
            }
        }
    }

    // Executor worker: one message at a time, FIFO off the inbound queue.
    {
        let state = state.clone();
        let bus = bus.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            info!("executor worker started");
            loop {
                let msg = tokio::select! {
                    msg = bus.consume_inbound() => msg,
                    _ = stop.changed() => break,
                };
                let Some(msg) = msg else { break };

                let reply = process_message(&state, &msg).await;
                let outbound = OutboundMessage {
                    channel: msg.channel.clone(),
                    chat_id: msg.chat_id.clone(),
                    content: reply,
                    media: vec![],
                    metadata: msg.metadata.clone(),
                };
                if bus.publish_outbound(outbound).is_err() {
                    break;
                }
            }
            info!("executor worker stopped");
        });
    }

    // Outbound dispatcher: queue → channel adapters.
    {
        let bus = bus.clone();
        let channels = channels.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = bus.consume_outbound() => msg,
                    _ = stop.changed() => break,
                };
                let Some(msg) = msg else { break };
                match channels.get(&msg.channel) {
                    Some(adapter) => {
                        for part in chunk_outbound(msg) {
                            if let Err(e) = adapter.send(&part).await {
                                error!("delivery to '{}' failed: {e}", part.channel);
                                break;
                            }
                        }
                    }
                    None => warn!("no adapter for channel '{}', dropping reply", msg.channel),
                }
            }
        });
    }

    if state.config.memory.enabled && state.config.memory.auto_summarize {
        crate::summarizer::spawn_summarizer(state.clone(), stop_rx.clone());
    }

    // Daily retention sweep for short-term conversation memories.
    if let Some(memory) = state.memory.clone() {
        let retention_days = state.config.memory.short_term_retention_days;
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => return,
                }
                match memory.expire_short_term(retention_days).await {
                    Ok(0) => {}
                    Ok(n) => info!("retention sweep removed {n} expired memories"),
                    Err(e) => warn!("retention sweep failed: {e}"),
                }
            }
        });
    }

    // Kick off a background re-embedding when the configured model differs
    // from what the table holds.
    if let Some(engine) = &migration {
        if state.config.memory.multi_embed.auto_migrate {
            match engine.needs_migration().await {
                Ok(true) => {
                    info!("embedding model changed; starting background migration");
                    if let Err(e) = engine.start().await {
                        error!("auto-migration failed to start: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("migration check failed: {e}"),
            }
        }
    }

    info!("runtime active; waiting for Ctrl-C");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("failed to listen for Ctrl-C: {e}"))?;

    info!("shutting down");
    if let Some(engine) = &migration {
        engine.pause();
    }
    for name in channels.names() {
        if let Some(adapter) = channels.get(&name) {
            adapter.stop().await;
        }
    }
    let _ = stop_tx.send(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_storage(config: &mut Config) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("wisp_runtime_{}", uuid::Uuid::new_v4()));
        config.memory.storage_path = dir.to_string_lossy().to_string();
        dir
    }

    #[test]
    fn test_build_state_minimal() {
        let mut config = Config::test_defaults();
        let dir = unique_storage(&mut config);
        let (state, migration) = build_state(config).unwrap();
        assert!(state.memory.is_some());
        assert!(migration.is_some());
        assert_eq!(state.sessions.session_count(), 0);
        assert!(state.tools.names().contains(&"shell_exec".to_string()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_build_state_memory_disabled() {
        let mut config = Config::test_defaults();
        config.memory.enabled = false;
        let (state, migration) = build_state(config).unwrap();
        assert!(state.memory.is_none());
        assert!(migration.is_none());
    }

    fn outbound(content: String) -> OutboundMessage {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("k".to_string(), serde_json::json!("v"));
        OutboundMessage {
            channel: "feishu".into(),
            chat_id: "c1".into(),
            content,
            media: vec!["data:image/png;base64,AA".into()],
            metadata,
        }
    }

    #[test]
    fn test_chunk_outbound_short_passthrough() {
        let parts = chunk_outbound(outbound("short reply".into()));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].content, "short reply");
        assert_eq!(parts[0].media.len(), 1);
    }

    #[test]
    fn test_chunk_outbound_splits_long_replies() {
        let long = "line one\n".repeat(1500);
        let parts = chunk_outbound(outbound(long.clone()));
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.content.len() <= OUTBOUND_CHUNK_BYTES);
            assert_eq!(part.channel, "feishu");
            assert_eq!(part.chat_id, "c1");
            assert_eq!(part.metadata["k"], "v");
        }
        // media rides on the first chunk only; content order is preserved
        assert_eq!(parts[0].media.len(), 1);
        assert!(parts[1..].iter().all(|p| p.media.is_empty()));
        let rejoined = parts
            .iter()
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(rejoined.trim_end(), long.trim_end());
    }

    #[test]
    fn test_build_state_without_embedder_has_no_migration() {
        let mut config = Config::test_defaults();
        let dir = unique_storage(&mut config);
        config.agents.models.embed = None;
        let (state, migration) = build_state(config).unwrap();
        assert!(state.memory.is_some());
        assert!(migration.is_none());
        let _ = std::fs::remove_dir_all(dir);
    }
}
