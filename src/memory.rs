use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::WispError;
use crate::memory_store::{
    call_blocking, model_to_column, Filter, MemoryEntry, MemoryKind, MemoryStore, NewMemory,
};
use crate::migration::{MigrationState, MigrationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    Fulltext,
    Vector,
    Hybrid,
    #[default]
    Auto,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Fulltext => "fulltext",
            SearchMode::Vector => "vector",
            SearchMode::Hybrid => "hybrid",
            SearchMode::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fulltext" => Some(SearchMode::Fulltext),
            "vector" => Some(SearchMode::Vector),
            "hybrid" => Some(SearchMode::Hybrid),
            "auto" => Some(SearchMode::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: Option<usize>,
    pub session_id: Option<String>,
    pub kind: Option<MemoryKind>,
    /// Embedding model to search against; defaults to the active one.
    pub target_model: Option<String>,
}

// --- content quality gate ---

/// Collapse whitespace and bound the length of memory content.
pub fn normalize_content(input: &str, max_chars: usize) -> Option<String> {
    let cleaned = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }
    Some(cleaned.chars().take(max_chars).collect())
}

/// Reject low-signal content before it becomes a long-term memory.
pub fn content_quality(content: &str) -> Result<(), &'static str> {
    let trimmed = content.trim().to_lowercase();
    let small_talk = ["hi", "hello", "thanks", "thank you", "ok", "okay", "你好", "谢谢"];
    if small_talk.iter().any(|s| trimmed == *s) {
        return Err("small talk");
    }
    if trimmed.chars().count() < 4 {
        return Err("too short");
    }
    if trimmed.contains("maybe")
        || trimmed.contains("i think")
        || trimmed.contains("not sure")
        || trimmed.contains("guess")
    {
        return Err("uncertain statement");
    }
    if !trimmed.chars().any(|c| c.is_alphanumeric() || !c.is_ascii()) {
        return Err("no signal");
    }
    Ok(())
}

/// Async facade over the dual-index store: embeds on write, dispatches
/// the four search modes, and consults the live migration state for
/// `auto`.
pub struct MemoryService {
    store: Arc<MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    migration: Mutex<Option<Arc<Mutex<MigrationState>>>>,
    search_limit: usize,
    max_models: usize,
}

impl MemoryService {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        search_limit: usize,
        max_models: usize,
    ) -> Self {
        MemoryService {
            store,
            embedder,
            migration: Mutex::new(None),
            search_limit: search_limit.max(1),
            max_models: max_models.max(1),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn attach_migration(&self, state: Arc<Mutex<MigrationState>>) {
        *self.migration.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    fn migration_snapshot(&self) -> Option<MigrationState> {
        let guard = self.migration.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn active_model(&self) -> Option<String> {
        self.embedder.as_ref().map(|e| e.model_key().to_string())
    }

    /// Persist one memory. Conversation content passes the quality gate;
    /// embedding failures degrade the record to fulltext-only.
    pub async fn remember(
        &self,
        session_id: &str,
        kind: MemoryKind,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Option<MemoryEntry>, WispError> {
        let Some(content) = normalize_content(content, 4000) else {
            return Ok(None);
        };
        if kind == MemoryKind::Conversation {
            if let Err(reason) = content_quality(&content) {
                debug!("memory skipped ({reason}): {content:.40}");
                return Ok(None);
            }
        }

        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(&content).await {
                Ok(vector) => Some((embedder.model_key().to_string(), vector)),
                Err(e) => {
                    warn!("embedding failed, storing fulltext-only: {e}");
                    None
                }
            },
            None => None,
        };

        let new = NewMemory {
            session_id: session_id.to_string(),
            kind,
            content,
            metadata,
        };
        let max_models = self.max_models;
        let active = self.active_model();
        let entry = call_blocking(self.store.clone(), move |store| {
            let entry = store.insert(
                &new,
                embedding
                    .as_ref()
                    .map(|(model, vector)| (model.as_str(), vector.as_slice())),
            )?;
            if let Some(active) = active {
                if store.vector_columns()?.len() > max_models {
                    let dropped = store.cleanup_old_vectors(max_models, &active)?;
                    if !dropped.is_empty() {
                        debug!("vector cleanup dropped {dropped:?}");
                    }
                }
            }
            Ok(entry)
        })
        .await?;
        Ok(Some(entry))
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let limit = opts.limit.unwrap_or(self.search_limit);
        let filter = Filter {
            session_id: opts.session_id.clone(),
            kind: opts.kind,
            created_after_ms: None,
        };
        let target_model = opts
            .target_model
            .clone()
            .or_else(|| self.active_model());

        match opts.mode {
            SearchMode::Fulltext => self.fulltext(query, limit, filter).await,
            SearchMode::Vector => match self.vector(query, &target_model, limit, &filter).await {
                Ok(hits) => Ok(hits),
                Err(e) => {
                    warn!("vector search unavailable ({e}); falling back to fulltext");
                    self.fulltext(query, limit, filter).await
                }
            },
            SearchMode::Hybrid => {
                let (vector_hits, fulltext_hits) = tokio::join!(
                    self.vector(query, &target_model, limit, &filter),
                    self.fulltext(query, limit, filter.clone())
                );
                let vector_hits = vector_hits.unwrap_or_else(|e| {
                    warn!("hybrid vector leg failed: {e}");
                    vec![]
                });
                Ok(merge_hits(vector_hits, fulltext_hits?, limit))
            }
            SearchMode::Auto => self.auto(query, &target_model, limit, filter).await,
        }
    }

    async fn fulltext(
        &self,
        query: &str,
        limit: usize,
        filter: Filter,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let query = query.to_string();
        call_blocking(self.store.clone(), move |store| {
            store.fulltext_search(&query, limit, &filter)
        })
        .await
    }

    async fn vector(
        &self,
        query: &str,
        target_model: &Option<String>,
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let Some(model) = target_model.clone() else {
            return Err(WispError::Embedding("no embedding model configured".into()));
        };
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| WispError::Embedding("no embedding service".into()))?;
        let query_vec = embedder.embed(query).await?;

        let column = model_to_column(&model);
        let filter = filter.clone();
        call_blocking(self.store.clone(), move |store| {
            store.vector_search(&column, &query_vec, limit, &filter)
        })
        .await
    }

    /// Auto mode: while a migration for the target model runs, hybrid
    /// across the migrated (vector) and unmigrated (fulltext, newer than
    /// the cursor) partitions; otherwise vector with fulltext fallback.
    async fn auto(
        &self,
        query: &str,
        target_model: &Option<String>,
        limit: usize,
        filter: Filter,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let migration = self.migration_snapshot();
        let migration_active = migration.as_ref().is_some_and(|m| {
            m.status == MigrationStatus::Running
                && target_model.as_deref() == Some(m.target_model.as_str())
        });

        if migration_active {
            let migrated_until = migration.and_then(|m| m.migrated_until).unwrap_or(0);
            let mut fulltext_filter = filter.clone();
            fulltext_filter.created_after_ms = Some(migrated_until);

            let (vector_hits, fulltext_hits) = tokio::join!(
                self.vector(query, target_model, limit, &filter),
                self.fulltext(query, limit, fulltext_filter)
            );
            let vector_hits = vector_hits.unwrap_or_else(|e| {
                warn!("migration-aware vector leg failed: {e}");
                vec![]
            });
            return Ok(merge_hits(vector_hits, fulltext_hits?, limit));
        }

        match self.vector(query, target_model, limit, &filter).await {
            Ok(hits) if !hits.is_empty() => Ok(hits),
            Ok(_) => self.fulltext(query, limit, filter).await,
            Err(e) => {
                debug!("auto search vector leg unavailable ({e}); using fulltext");
                self.fulltext(query, limit, filter).await
            }
        }
    }

    pub async fn expire_short_term(&self, retention_days: u32) -> Result<usize, WispError> {
        call_blocking(self.store.clone(), move |store| {
            store.expire_short_term(retention_days)
        })
        .await
    }
}

/// Vector hits first, then fulltext, de-duplicated by id and truncated.
fn merge_hits(
    vector_hits: Vec<MemoryEntry>,
    fulltext_hits: Vec<MemoryEntry>,
    limit: usize,
) -> Vec<MemoryEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for entry in vector_hits.into_iter().chain(fulltext_hits) {
        if seen.insert(entry.id.clone()) {
            merged.push(entry);
            if merged.len() >= limit {
                break;
            }
        }
    }
    merged
}
