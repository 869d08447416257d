use std::collections::HashMap;
use std::sync::Mutex;

/// One stored history turn. System turns are never stored; they are
/// re-assembled on every request.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Turn {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

struct SessionEntry {
    turns: Vec<Turn>,
    /// Monotonic counter value at the last write; lowest goes first when
    /// the store is over capacity.
    last_used: u64,
    /// Wall-clock ms of the last append, for idle detection.
    last_activity_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: String,
    pub turn_count: usize,
    pub idle_ms: i64,
}

/// Process-wide session history map. Owned by the executor; everything
/// else sees only snapshots. Bounded two ways: 50 turns per session and
/// 1000 sessions with LRU eviction on insert.
pub struct SessionStore {
    inner: Mutex<SessionMap>,
    max_turns: usize,
    max_sessions: usize,
}

struct SessionMap {
    sessions: HashMap<String, SessionEntry>,
    clock: u64,
}

pub const MAX_TURNS: usize = 50;
pub const MAX_SESSIONS: usize = 1000;

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new(MAX_TURNS, MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new(max_turns: usize, max_sessions: usize) -> Self {
        SessionStore {
            inner: Mutex::new(SessionMap {
                sessions: HashMap::new(),
                clock: 0,
            }),
            max_turns: max_turns.max(1),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn history(&self, key: &str) -> Vec<Turn> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.sessions
            .get(key)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// Append a completed (user, assistant) exchange, trimming the
    /// session to the most recent turns and evicting the least recently
    /// used session when the map is over capacity.
    pub fn append_exchange(&self, key: &str, user: Turn, assistant: Turn) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.clock += 1;
        let clock = map.clock;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let max_turns = self.max_turns;
        let entry = map
            .sessions
            .entry(key.to_string())
            .or_insert_with(|| SessionEntry {
                turns: Vec::new(),
                last_used: clock,
                last_activity_ms: now_ms,
            });
        entry.turns.push(user);
        entry.turns.push(assistant);
        if entry.turns.len() > max_turns {
            let excess = entry.turns.len() - max_turns;
            entry.turns.drain(..excess);
        }
        entry.last_used = clock;
        entry.last_activity_ms = now_ms;

        while map.sessions.len() > self.max_sessions {
            let oldest = map
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    map.sessions.remove(&k);
                }
                None => break,
            }
        }
    }

    /// Keep only the most recent `keep` turns (summarizer rollup).
    pub fn truncate(&self, key: &str, keep: usize) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.sessions.get_mut(key) {
            if entry.turns.len() > keep {
                let excess = entry.turns.len() - keep;
                entry.turns.drain(..excess);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.sessions.len()
    }

    pub fn turn_count(&self, key: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.sessions.get(key).map(|s| s.turns.len()).unwrap_or(0)
    }

    /// Snapshot for the summarizer: per-session turn counts and idle
    /// times, without exposing the map itself.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.sessions
            .iter()
            .map(|(key, s)| SessionSnapshot {
                key: key.clone(),
                turn_count: s.turns.len(),
                idle_ms: (now_ms - s.last_activity_ms).max(0),
            })
            .collect()
    }
}
