use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::WispError;
use crate::memory_store::{call_blocking, model_to_column, MemoryStore};

pub const STATE_FILE: &str = "migration-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: String,
    pub error: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub target_model: String,
    pub status: MigrationStatus,
    pub total_records: u64,
    pub migrated_count: u64,
    /// Epoch-ms high-water mark over processed records' `created_at`.
    pub migrated_until: Option<i64>,
    pub batch_size: usize,
    #[serde(default)]
    pub failed_records: Vec<FailedRecord>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl MigrationState {
    pub fn idle() -> Self {
        MigrationState {
            target_model: String::new(),
            status: MigrationStatus::Idle,
            total_records: 0,
            migrated_count: 0,
            migrated_until: None,
            batch_size: 50,
            failed_records: vec![],
            started_at: None,
            completed_at: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be positive".into());
        }
        if self.migrated_count > self.total_records {
            return Err(format!(
                "migrated_count {} exceeds total_records {}",
                self.migrated_count, self.total_records
            ));
        }
        if self.status == MigrationStatus::Running && self.target_model.is_empty() {
            return Err("running migration without a target model".into());
        }
        Ok(())
    }
}

/// Load the persisted state. A file that fails to parse or validate is
/// copied to a timestamped backup (never deleted) and treated as idle.
pub fn load_state(path: &Path) -> MigrationState {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return MigrationState::idle(),
    };

    let parsed: Result<MigrationState, _> = serde_json::from_str(&raw);
    let problem = match parsed {
        Ok(state) => match state.validate() {
            Ok(()) => {
                // A process restart leaves no live worker: a persisted
                // "running" state resumes as paused.
                let mut state = state;
                if state.status == MigrationStatus::Running {
                    state.status = MigrationStatus::Paused;
                }
                return state;
            }
            Err(e) => e,
        },
        Err(e) => e.to_string(),
    };

    let backup = path.with_file_name(format!(
        "{}.corrupted.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or(STATE_FILE),
        Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ")
    ));
    if let Err(e) = std::fs::copy(path, &backup) {
        error!("failed to back up corrupt migration state: {e}");
    } else {
        warn!(
            "migration state invalid ({problem}); backed up to {}",
            backup.display()
        );
    }
    MigrationState::idle()
}

/// Persist the state with an fsync, as the worker does after every batch.
pub fn save_state(path: &Path, state: &MigrationState) -> Result<(), WispError> {
    use std::io::Write;
    let json = serde_json::to_string_pretty(state)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

// --- adaptive pacing ---

pub const INITIAL_INTERVAL_MS: u64 = 500;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 5000;

/// Inter-batch sleep controller: speeds up while batches are cheap,
/// backs off exponentially on consecutive failures. A configured fixed
/// interval disables adaptation.
#[derive(Debug)]
pub struct AdaptivePacer {
    interval_ms: u64,
    consecutive_failures: u32,
    fixed_ms: Option<u64>,
}

impl AdaptivePacer {
    pub fn new(fixed_interval_ms: u64) -> Self {
        AdaptivePacer {
            interval_ms: INITIAL_INTERVAL_MS,
            consecutive_failures: 0,
            fixed_ms: (fixed_interval_ms > 0).then_some(fixed_interval_ms),
        }
    }

    pub fn next_interval(&self) -> Duration {
        Duration::from_millis(self.fixed_ms.unwrap_or(self.interval_ms))
    }

    pub fn record_batch(&mut self, avg_record_ms: u64, failures: usize) {
        if failures > 0 {
            self.consecutive_failures += 1;
            let factor = 2u64.saturating_pow(self.consecutive_failures.min(6));
            self.interval_ms = (self.interval_ms.saturating_mul(factor))
                .clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        } else {
            self.consecutive_failures = 0;
            if avg_record_ms * 2 < self.interval_ms {
                self.interval_ms =
                    (self.interval_ms * 4 / 5).clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[derive(Debug, Clone)]
pub enum MigrationEvent {
    Progress {
        migrated_count: u64,
        total_records: u64,
        progress: f64,
        batch_size: usize,
        success_count: usize,
        fail_count: usize,
    },
    Complete,
    Error(String),
}

/// Background re-embedding of existing memories into a new model's
/// vector column. Single worker per store; control calls flip the shared
/// state and the worker observes it between records.
pub struct MigrationEngine {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    state: Arc<Mutex<MigrationState>>,
    state_path: PathBuf,
    batch_size: usize,
    fixed_interval_ms: u64,
    events: Mutex<Option<UnboundedSender<MigrationEvent>>>,
}

impl MigrationEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        fixed_interval_ms: u64,
    ) -> Self {
        let state_path = store.dir().join(STATE_FILE);
        let state = load_state(&state_path);
        MigrationEngine {
            store,
            embedder,
            state: Arc::new(Mutex::new(state)),
            state_path,
            batch_size: batch_size.max(1),
            fixed_interval_ms,
            events: Mutex::new(None),
        }
    }

    /// Shared handle for migration-aware search.
    pub fn shared_state(&self) -> Arc<Mutex<MigrationState>> {
        self.state.clone()
    }

    pub fn state(&self) -> MigrationState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MigrationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> UnboundedReceiver<MigrationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    fn emit(&self, event: MigrationEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    fn persist(&self) {
        let state = self.lock_state().clone();
        if let Err(e) = save_state(&self.state_path, &state) {
            error!("failed to persist migration state: {e}");
        }
    }

    /// Whether any record still lacks the configured model's vector.
    pub async fn needs_migration(&self) -> Result<bool, WispError> {
        let column = model_to_column(self.embedder.model_key());
        let pending = call_blocking(self.store.clone(), move |s| {
            if s.count()? == 0 {
                return Ok(false);
            }
            Ok(!s.fetch_unmigrated(&column, 1)?.is_empty())
        })
        .await?;
        Ok(pending)
    }

    /// Begin a fresh migration run. Only one may be running at a time.
    pub async fn start(self: &Arc<Self>) -> Result<(), WispError> {
        let target = self.embedder.model_key().to_string();
        let total = call_blocking(self.store.clone(), |s| s.count()).await? as u64;

        {
            let mut state = self.lock_state();
            if state.status == MigrationStatus::Running {
                return Err(WispError::Migration("a migration is already running".into()));
            }
            *state = MigrationState {
                target_model: target.clone(),
                status: MigrationStatus::Running,
                total_records: total,
                migrated_count: 0,
                migrated_until: None,
                batch_size: self.batch_size,
                failed_records: vec![],
                started_at: Some(Utc::now().to_rfc3339()),
                completed_at: None,
            };
        }
        self.persist();
        info!("migration to {target} started ({total} records)");
        self.spawn_worker();
        Ok(())
    }

    /// Reversible stop: the worker exits after the current record.
    pub fn pause(&self) {
        let mut state = self.lock_state();
        if state.status == MigrationStatus::Running {
            state.status = MigrationStatus::Paused;
            drop(state);
            self.persist();
            info!("migration paused");
        }
    }

    /// Continue a paused run from the persisted cursor. Already-migrated
    /// records are never re-embedded.
    pub fn resume(self: &Arc<Self>) -> Result<(), WispError> {
        {
            let mut state = self.lock_state();
            match state.status {
                MigrationStatus::Paused => state.status = MigrationStatus::Running,
                other => {
                    return Err(WispError::Migration(format!(
                        "cannot resume migration in state {other:?}"
                    )))
                }
            }
        }
        self.persist();
        info!("migration resumed");
        self.spawn_worker();
        Ok(())
    }

    /// Re-attempt failed records (all of them, or a selected id set).
    pub async fn retry_failed(&self, ids: Option<Vec<String>>) -> Result<usize, WispError> {
        let selected: Vec<FailedRecord> = {
            let state = self.lock_state();
            state
                .failed_records
                .iter()
                .filter(|f| ids.as_ref().is_none_or(|ids| ids.contains(&f.id)))
                .cloned()
                .collect()
        };

        let target = self.embedder.model_key().to_string();
        let column = model_to_column(&target);
        let mut recovered = 0usize;
        for failed in selected {
            let record = call_blocking(self.store.clone(), {
                let id = failed.id.clone();
                move |s| s.get(&id)
            })
            .await?;
            let Some(record) = record else {
                // row is gone; drop the stale failure entry
                self.lock_state().failed_records.retain(|f| f.id != failed.id);
                continue;
            };

            match self.embedder.embed(&record.content).await {
                Ok(vector) => {
                    let update = call_blocking(self.store.clone(), {
                        let id = record.id.clone();
                        let column = column.clone();
                        let target = target.clone();
                        move |s| s.update_vector(&id, &column, &vector, &target)
                    })
                    .await;
                    match update {
                        Ok(()) => {
                            let mut state = self.lock_state();
                            state.failed_records.retain(|f| f.id != record.id);
                            state.migrated_count =
                                (state.migrated_count + 1).min(state.total_records);
                            recovered += 1;
                        }
                        Err(e) => warn!("retry of {} failed: {e}", record.id),
                    }
                }
                Err(e) => warn!("retry embed of {} failed: {e}", record.id),
            }
        }
        self.persist();
        Ok(recovered)
    }

    /// Delete the state file once a completed run has been confirmed.
    pub fn confirm_completed(&self) -> Result<bool, WispError> {
        let state = self.lock_state().clone();
        if state.status != MigrationStatus::Completed {
            return Ok(false);
        }
        match std::fs::remove_file(&self.state_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.worker_loop().await;
        });
    }

    async fn worker_loop(self: Arc<Self>) {
        let target = self.embedder.model_key().to_string();
        let column = match call_blocking(self.store.clone(), {
            let target = target.clone();
            move |s| s.ensure_vector_column(&target)
        })
        .await
        {
            Ok(column) => column,
            Err(e) => {
                error!("migration worker could not create vector column: {e}");
                self.lock_state().status = MigrationStatus::Error;
                self.persist();
                self.emit(MigrationEvent::Error(e.to_string()));
                return;
            }
        };

        let mut pacer = AdaptivePacer::new(self.fixed_interval_ms);
        let batch_size = self.lock_state().batch_size.max(1);

        loop {
            if self.lock_state().status != MigrationStatus::Running {
                self.persist();
                return;
            }

            let batch = match call_blocking(self.store.clone(), {
                let column = column.clone();
                move |s| s.fetch_unmigrated(&column, batch_size)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!("migration batch fetch failed: {e}");
                    self.lock_state().status = MigrationStatus::Error;
                    self.persist();
                    self.emit(MigrationEvent::Error(e.to_string()));
                    return;
                }
            };

            // Skip records already recorded as failed; they wait for
            // retry_failed.
            let pending: Vec<_> = {
                let state = self.lock_state();
                batch
                    .into_iter()
                    .filter(|r| !state.failed_records.iter().any(|f| f.id == r.id))
                    .collect()
            };

            if pending.is_empty() {
                let mut state = self.lock_state();
                state.status = MigrationStatus::Completed;
                state.completed_at = Some(Utc::now().to_rfc3339());
                drop(state);
                self.persist();
                self.emit(MigrationEvent::Complete);
                info!("migration to {target} completed");
                return;
            }

            let started = std::time::Instant::now();
            let batch_len = pending.len();
            let mut success_count = 0usize;
            let mut fail_count = 0usize;

            for record in pending {
                if self.lock_state().status != MigrationStatus::Running {
                    break;
                }

                let outcome = match self.embedder.embed(&record.content).await {
                    Ok(vector) => {
                        call_blocking(self.store.clone(), {
                            let id = record.id.clone();
                            let column = column.clone();
                            let target = target.clone();
                            move |s| s.update_vector(&id, &column, &vector, &target)
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };

                let mut state = self.lock_state();
                match outcome {
                    Ok(()) => {
                        success_count += 1;
                        state.migrated_count =
                            (state.migrated_count + 1).min(state.total_records);
                        let created = record.created_ms();
                        state.migrated_until = Some(
                            state
                                .migrated_until
                                .map_or(created, |cursor| cursor.max(created)),
                        );
                    }
                    Err(e) => {
                        fail_count += 1;
                        warn!("migration of record {} failed: {e}", record.id);
                        state.failed_records.push(FailedRecord {
                            id: record.id.clone(),
                            error: e.to_string(),
                            timestamp: Utc::now().to_rfc3339(),
                        });
                    }
                }
            }

            self.persist();
            let (migrated_count, total_records) = {
                let state = self.lock_state();
                (state.migrated_count, state.total_records)
            };
            let progress = if total_records == 0 {
                100.0
            } else {
                migrated_count as f64 * 100.0 / total_records as f64
            };
            self.emit(MigrationEvent::Progress {
                migrated_count,
                total_records,
                progress,
                batch_size,
                success_count,
                fail_count,
            });

            let avg_record_ms = started.elapsed().as_millis() as u64 / batch_len.max(1) as u64;
            pacer.record_batch(avg_record_ms, fail_count);
            tokio::time::sleep(pacer.next_interval()).await;
        }
    }
}
