use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::llm_types::ChatMessage;
use crate::memory_store::MemoryKind;
use crate::runtime::AppState;
use crate::text::floor_char_boundary;

const TICK_SECS: u64 = 30;
/// Turns kept verbatim after a rollup.
const KEEP_RECENT: usize = 10;
/// Idle sessions below this size are not worth a summary.
const MIN_IDLE_TURNS: usize = 4;
/// Upper bound on the stored summary.
const MAX_SUMMARY_CHARS: usize = 2000;
/// Transcript cap fed to the model.
const MAX_TRANSCRIPT_BYTES: usize = 20_000;

/// Whether a session is due for a rollup. `last_summarized` is the turn
/// count right after the previous rollup; no new turns means no new
/// summary.
pub(crate) fn should_summarize(
    turn_count: usize,
    idle_ms: i64,
    threshold: usize,
    idle_timeout_ms: u64,
    last_summarized: Option<usize>,
) -> bool {
    if last_summarized.is_some_and(|last| turn_count <= last) {
        return false;
    }
    if turn_count >= threshold {
        return true;
    }
    turn_count >= MIN_IDLE_TURNS && idle_ms >= idle_timeout_ms as i64
}

/// Background watcher that rolls idle or long sessions into `summary`
/// memories and trims the live history. Failures are logged and retried
/// on the next trigger; the executor's foreground loop is never blocked.
pub fn spawn_summarizer(state: Arc<AppState>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        info!("summarizer started");
        let mut last_summarized: HashMap<String, usize> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    info!("summarizer stopping");
                    return;
                }
            }

            let threshold = state.config.memory.summarize_threshold;
            let idle_timeout = state.config.memory.idle_timeout_ms;

            for snapshot in state.sessions.snapshots() {
                if !should_summarize(
                    snapshot.turn_count,
                    snapshot.idle_ms,
                    threshold,
                    idle_timeout,
                    last_summarized.get(&snapshot.key).copied(),
                ) {
                    continue;
                }

                match summarize_session(&state, &snapshot.key).await {
                    Ok(()) => {
                        state.sessions.truncate(&snapshot.key, KEEP_RECENT);
                        last_summarized
                            .insert(snapshot.key.clone(), state.sessions.turn_count(&snapshot.key));
                    }
                    Err(e) => warn!("summarize of {} failed, will retry: {e}", snapshot.key),
                }
            }
        }
    });
}

async fn summarize_session(state: &AppState, session_key: &str) -> anyhow::Result<()> {
    let history = state.sessions.history(session_key);
    if history.is_empty() {
        return Ok(());
    }

    let mut transcript = String::new();
    for turn in &history {
        transcript.push_str(&format!("[{}]: {}\n", turn.role, turn.content));
    }
    if transcript.len() > MAX_TRANSCRIPT_BYTES {
        let cut = floor_char_boundary(&transcript, MAX_TRANSCRIPT_BYTES);
        transcript.truncate(cut);
        transcript.push_str("\n... (truncated)");
    }

    let messages = vec![
        ChatMessage::system(
            "You condense conversations. Keep key facts, preferences, decisions and open tasks. \
             Be brief but specific.",
        ),
        ChatMessage::user(format!("Summarize this conversation:\n\n{transcript}")),
    ];
    let gen = state.config.gen_defaults();
    let response = state
        .gateway
        .chat(&messages, &[], &state.config.agents.models.chat, &gen)
        .await?;

    let mut summary = response.content.trim().to_string();
    if summary.is_empty() {
        anyhow::bail!("model returned an empty summary");
    }
    if summary.chars().count() > MAX_SUMMARY_CHARS {
        summary = summary.chars().take(MAX_SUMMARY_CHARS).collect();
    }

    if let Some(memory) = &state.memory {
        memory
            .remember(
                session_key,
                MemoryKind::Summary,
                &summary,
                serde_json::json!({"turns": history.len()}),
            )
            .await?;
    }
    info!("summarized session {session_key} ({} turns)", history.len());
    Ok(())
}
