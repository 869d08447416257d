use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::WispError;

/// Hard cap on candidates returned by a single vector query.
pub const MAX_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Conversation,
    Summary,
    Entity,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Summary => "summary",
            MemoryKind::Entity => "entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "conversation" => Some(MemoryKind::Conversation),
            "summary" => Some(MemoryKind::Summary),
            "entity" => Some(MemoryKind::Entity),
            _ => None,
        }
    }

    fn markdown_heading(self) -> &'static str {
        match self {
            MemoryKind::Conversation => "## 💬 对话",
            MemoryKind::Summary => "## 📝 摘要",
            MemoryKind::Entity => "## 🏷️ 实体",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub id: String,
    pub session_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_embed: Option<String>,
    /// model id → epoch-ms of the embedding write
    pub embed_versions: HashMap<String, i64>,
    /// vector column name → non-empty vector; empty blobs are reported
    /// as absent
    pub vectors: HashMap<String, Vec<f32>>,
}

impl MemoryEntry {
    pub fn created_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    pub fn has_vector(&self, column: &str) -> bool {
        self.vectors.get(column).is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub session_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Equality filters shared by both indexes, plus the migration-aware
/// recency bound for fulltext.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub session_id: Option<String>,
    pub kind: Option<MemoryKind>,
    pub created_after_ms: Option<i64>,
}

// --- vector column codec ---

/// Encode a fully-qualified model key into a filesystem/SQL-safe column
/// name: `/`→`_s_`, `:`→`_c_`, `.`→`_d_`, `-`→`_h_`, prefixed `vector_`.
pub fn model_to_column(model_key: &str) -> String {
    let mut out = String::with_capacity(model_key.len() + 8);
    out.push_str("vector_");
    for c in model_key.chars() {
        match c {
            '/' => out.push_str("_s_"),
            ':' => out.push_str("_c_"),
            '.' => out.push_str("_d_"),
            '-' => out.push_str("_h_"),
            other => out.push(other),
        }
    }
    out
}

/// Deterministic inverse of [`model_to_column`].
pub fn column_to_model(column: &str) -> Option<String> {
    let body = column.strip_prefix("vector_")?;
    Some(
        body.replace("_s_", "/")
            .replace("_c_", ":")
            .replace("_d_", ".")
            .replace("_h_", "-"),
    )
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// --- keyword extraction for the fulltext index ---

fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0xF900..=0xFAFF
    )
}

/// Keywords for fulltext scoring: ASCII words of length ≥ 2, digit runs
/// of length ≥ 2, and CJK 2-grams (plus 3-grams once the query has ≥ 4
/// CJK chars).
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut push = |kw: String| {
        if seen.insert(kw.clone()) {
            keywords.push(kw);
        }
    };

    let mut ascii_run = String::new();
    let mut digit_run = String::new();
    for c in query.chars() {
        if c.is_ascii_alphanumeric() {
            ascii_run.push(c.to_ascii_lowercase());
        } else {
            if ascii_run.len() >= 2 {
                push(ascii_run.clone());
            }
            ascii_run.clear();
        }
        if c.is_ascii_digit() {
            digit_run.push(c);
        } else {
            if digit_run.len() >= 2 {
                push(digit_run.clone());
            }
            digit_run.clear();
        }
    }
    if ascii_run.len() >= 2 {
        push(ascii_run);
    }
    if digit_run.len() >= 2 {
        push(digit_run);
    }

    let cjk: Vec<char> = query.chars().filter(|c| is_cjk(*c)).collect();
    for pair in cjk.windows(2) {
        push(pair.iter().collect());
    }
    if cjk.len() >= 4 {
        for tri in cjk.windows(3) {
            push(tri.iter().collect());
        }
    }

    keywords
}

/// Occurrence-count score of `content` against extracted keywords, after
/// lowercasing and regex-escaping each keyword.
pub fn score_content(content: &str, keywords: &[String]) -> usize {
    if keywords.is_empty() {
        return 0;
    }
    let haystack = content.to_lowercase();
    let mut score = 0usize;
    for kw in keywords {
        let Ok(re) = regex::Regex::new(&regex::escape(kw)) else {
            continue;
        };
        score += re.find_iter(&haystack).count();
    }
    score
}

/// Dual-index memory table: structured fields plus one dense-vector BLOB
/// column per embedding model, with an append-only markdown mirror under
/// `sessions/` that is never read back for retrieval.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    dir: PathBuf,
}

impl MemoryStore {
    /// Open (or create) the store. When `current_model` is known, a
    /// legacy single `vector` column is upgraded into that model's
    /// column on the spot.
    pub fn open(dir: &Path, current_model: Option<&str>) -> Result<Self, WispError> {
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(dir.join("sessions"))?;
        std::fs::create_dir_all(dir.join("summaries"))?;

        let conn = Connection::open(dir.join("wisp.db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                active_embed TEXT,
                embed_versions TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_memories_session
                ON memories(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_memories_created
                ON memories(created_at);",
        )?;

        let store = MemoryStore {
            conn: Mutex::new(conn),
            dir: dir.to_path_buf(),
        };
        if let Some(model) = current_model {
            store.upgrade_legacy_schema(model)?;
        }
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn table_columns(conn: &Connection) -> Result<Vec<String>, WispError> {
        let mut stmt = conn.prepare("PRAGMA table_info(memories)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn vector_columns(&self) -> Result<Vec<String>, WispError> {
        let conn = self.lock();
        Ok(Self::table_columns(&conn)?
            .into_iter()
            .filter(|c| c.starts_with("vector_"))
            .collect())
    }

    /// Older tables stored a single anonymous `vector` column. Rename its
    /// data into the current model's column and backfill the tracking
    /// fields.
    fn upgrade_legacy_schema(&self, current_model: &str) -> Result<(), WispError> {
        let conn = self.lock();
        let columns = Self::table_columns(&conn)?;

        // Tables predating multi-embed lack the tracking fields entirely.
        if !columns.iter().any(|c| c == "active_embed") {
            conn.execute("ALTER TABLE memories ADD COLUMN active_embed TEXT", [])?;
        }
        if !columns.iter().any(|c| c == "embed_versions") {
            conn.execute(
                "ALTER TABLE memories ADD COLUMN embed_versions TEXT NOT NULL DEFAULT '{}'",
                [],
            )?;
        }

        if !columns.iter().any(|c| c == "vector") {
            return Ok(());
        }

        let target = model_to_column(current_model);
        if !columns.iter().any(|c| c == &target) {
            conn.execute(
                &format!("ALTER TABLE memories ADD COLUMN \"{target}\" BLOB"),
                [],
            )?;
        }
        let now = Utc::now().timestamp_millis();
        let versions = serde_json::json!({ current_model: now }).to_string();
        conn.execute(
            &format!(
                "UPDATE memories
                 SET \"{target}\" = vector,
                     active_embed = ?1,
                     embed_versions = ?2,
                     updated_at = ?3
                 WHERE vector IS NOT NULL AND length(vector) > 0"
            ),
            rusqlite::params![current_model, versions, now],
        )?;
        conn.execute("ALTER TABLE memories DROP COLUMN vector", [])?;
        info!("migrated legacy vector column into {target}");
        Ok(())
    }

    /// Lazily add the vector column for a model.
    pub fn ensure_vector_column(&self, model_key: &str) -> Result<String, WispError> {
        let column = model_to_column(model_key);
        let conn = self.lock();
        let columns = Self::table_columns(&conn)?;
        if !columns.iter().any(|c| c == &column) {
            conn.execute(
                &format!("ALTER TABLE memories ADD COLUMN \"{column}\" BLOB"),
                [],
            )?;
            info!("added vector column {column}");
        }
        Ok(column)
    }

    /// Insert one memory row. The embedding is optional: when the
    /// embedding service is unavailable the record is still written and
    /// remains reachable through fulltext search.
    pub fn insert(
        &self,
        new: &NewMemory,
        embedding: Option<(&str, &[f32])>,
    ) -> Result<MemoryEntry, WispError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let mut active_embed: Option<String> = None;
        let mut embed_versions: HashMap<String, i64> = HashMap::new();
        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        if let Some((model, vector)) = embedding {
            let column = self.ensure_vector_column(model)?;
            active_embed = Some(model.to_string());
            embed_versions.insert(model.to_string(), now);
            vectors.insert(column, vector.to_vec());
        }

        let entry = MemoryEntry {
            id,
            session_id: new.session_id.clone(),
            kind: new.kind,
            content: new.content.clone(),
            metadata: new.metadata.clone(),
            created_at: Utc.timestamp_millis_opt(now).single().unwrap_or_else(Utc::now),
            updated_at: Utc.timestamp_millis_opt(now).single().unwrap_or_else(Utc::now),
            active_embed,
            embed_versions,
            vectors,
        };

        self.insert_row(&entry)?;
        if let Err(e) = self.append_markdown(&entry) {
            warn!("markdown mirror append failed: {e}");
        }
        Ok(entry)
    }

    fn insert_row(&self, entry: &MemoryEntry) -> Result<(), WispError> {
        let conn = self.lock();
        let mut columns = vec![
            "id",
            "session_id",
            "kind",
            "content",
            "metadata",
            "created_at",
            "updated_at",
            "active_embed",
            "embed_versions",
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(entry.id.clone()),
            SqlValue::Text(entry.session_id.clone()),
            SqlValue::Text(entry.kind.as_str().to_string()),
            SqlValue::Text(entry.content.clone()),
            SqlValue::Text(entry.metadata.to_string()),
            SqlValue::Integer(entry.created_at.timestamp_millis()),
            SqlValue::Integer(entry.updated_at.timestamp_millis()),
            match &entry.active_embed {
                Some(m) => SqlValue::Text(m.clone()),
                None => SqlValue::Null,
            },
            SqlValue::Text(
                serde_json::to_string(&entry.embed_versions).unwrap_or_else(|_| "{}".into()),
            ),
        ];

        for (column, vector) in &entry.vectors {
            columns.push(format!("\"{column}\""));
            values.push(SqlValue::Blob(vec_to_blob(vector)));
        }

        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO memories ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryEntry>, WispError> {
        let entries = self.query_entries(
            "id = ?1",
            vec![SqlValue::Text(id.to_string())],
            None,
            None,
        )?;
        Ok(entries.into_iter().next())
    }

    pub fn delete(&self, id: &str) -> Result<bool, WispError> {
        let conn = self.lock();
        let rows = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub fn count(&self) -> Result<i64, WispError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT count(*) FROM memories", [], |row| row.get(0))?)
    }

    fn filter_sql(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
        let mut clauses = Vec::new();
        if let Some(session_id) = &filter.session_id {
            params.push(SqlValue::Text(session_id.clone()));
            clauses.push(format!("session_id = ?{}", params.len()));
        }
        if let Some(kind) = filter.kind {
            params.push(SqlValue::Text(kind.as_str().to_string()));
            clauses.push(format!("kind = ?{}", params.len()));
        }
        if let Some(after) = filter.created_after_ms {
            params.push(SqlValue::Integer(after));
            clauses.push(format!("created_at > ?{}", params.len()));
        }
        if clauses.is_empty() {
            "1=1".into()
        } else {
            clauses.join(" AND ")
        }
    }

    fn query_entries(
        &self,
        where_clause: &str,
        params: Vec<SqlValue>,
        order: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let conn = self.lock();
        let mut sql = format!("SELECT * FROM memories WHERE {where_clause}");
        if let Some(order) = order {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(Self::row_to_entry(row, &names)?);
        }
        Ok(entries)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>, names: &[String]) -> Result<MemoryEntry, WispError> {
        let mut entry = MemoryEntry {
            id: String::new(),
            session_id: String::new(),
            kind: MemoryKind::Conversation,
            content: String::new(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            active_embed: None,
            embed_versions: HashMap::new(),
            vectors: HashMap::new(),
        };

        for (i, name) in names.iter().enumerate() {
            match name.as_str() {
                "id" => entry.id = row.get(i)?,
                "session_id" => entry.session_id = row.get(i)?,
                "kind" => {
                    let raw: String = row.get(i)?;
                    entry.kind = MemoryKind::parse(&raw).unwrap_or(MemoryKind::Conversation);
                }
                "content" => entry.content = row.get(i)?,
                "metadata" => {
                    let raw: String = row.get(i)?;
                    entry.metadata =
                        serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
                }
                "created_at" => {
                    let ms: i64 = row.get(i)?;
                    entry.created_at = Utc
                        .timestamp_millis_opt(ms)
                        .single()
                        .unwrap_or_else(Utc::now);
                }
                "updated_at" => {
                    let ms: i64 = row.get(i)?;
                    entry.updated_at = Utc
                        .timestamp_millis_opt(ms)
                        .single()
                        .unwrap_or_else(Utc::now);
                }
                "active_embed" => entry.active_embed = row.get(i)?,
                "embed_versions" => {
                    let raw: String = row.get(i)?;
                    entry.embed_versions = serde_json::from_str(&raw).unwrap_or_default();
                }
                column if column.starts_with("vector_") => {
                    let blob: Option<Vec<u8>> = row.get(i)?;
                    if let Some(blob) = blob {
                        let vector = blob_to_vec(&blob);
                        // present-but-empty is reported as absent
                        if !vector.is_empty() {
                            entry.vectors.insert(column.to_string(), vector);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(entry)
    }

    /// Keyword scan: score every candidate passing the filters, keep
    /// strictly positive scores, order by score then recency.
    pub fn fulltext_search(
        &self,
        query: &str,
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        let keywords = extract_keywords(query);
        if keywords.is_empty() {
            return Ok(vec![]);
        }

        let mut params = Vec::new();
        let where_clause = Self::filter_sql(filter, &mut params);
        let candidates = self.query_entries(&where_clause, params, Some("created_at DESC"), None)?;

        let mut scored: Vec<(usize, MemoryEntry)> = candidates
            .into_iter()
            .map(|e| (score_content(&e.content, &keywords), e))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    /// Fixed dimension of a column, from its first populated row.
    pub fn column_dimension(&self, column: &str) -> Result<Option<usize>, WispError> {
        if !self.vector_columns()?.iter().any(|c| c == column) {
            return Ok(None);
        }
        let conn = self.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                &format!(
                    "SELECT \"{column}\" FROM memories
                     WHERE \"{column}\" IS NOT NULL AND length(\"{column}\") > 0
                     LIMIT 1"
                ),
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
            .flatten();
        Ok(blob.map(|b| b.len() / 4))
    }

    /// Brute-force cosine kNN over one vector column, bounded by
    /// `MAX_SEARCH_LIMIT`. A dimension mismatch is an error so callers
    /// can fall back to fulltext.
    pub fn vector_search(
        &self,
        column: &str,
        query_vec: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        match self.column_dimension(column)? {
            None => return Ok(vec![]),
            Some(dim) if dim != query_vec.len() => {
                return Err(WispError::Embedding(format!(
                    "query dimension {} does not match column {column} dimension {dim}",
                    query_vec.len()
                )));
            }
            Some(_) => {}
        }

        let mut params = Vec::new();
        let mut where_clause = Self::filter_sql(filter, &mut params);
        where_clause.push_str(&format!(
            " AND \"{column}\" IS NOT NULL AND length(\"{column}\") > 0"
        ));
        let candidates = self.query_entries(&where_clause, params, None, None)?;

        let mut scored: Vec<(f32, MemoryEntry)> = candidates
            .into_iter()
            .filter_map(|e| {
                e.vectors
                    .get(column)
                    .map(|v| (cosine_similarity(query_vec, v), e.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(limit.min(MAX_SEARCH_LIMIT))
            .map(|(_, e)| e)
            .collect())
    }

    /// Rows still lacking the target column's vector, newest first.
    pub fn fetch_unmigrated(
        &self,
        column: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, WispError> {
        if !self.vector_columns()?.iter().any(|c| c == column) {
            // Column not created yet: everything is unmigrated.
            return self.query_entries("1=1", vec![], Some("created_at DESC"), Some(limit));
        }
        self.query_entries(
            &format!("\"{column}\" IS NULL OR length(\"{column}\") = 0"),
            vec![],
            Some("created_at DESC"),
            Some(limit),
        )
    }

    /// Non-atomic vector update: snapshot the row, delete it, insert the
    /// updated version. A failed insert restores the snapshot and
    /// re-raises.
    pub fn update_vector(
        &self,
        id: &str,
        column: &str,
        vector: &[f32],
        model_id: &str,
    ) -> Result<(), WispError> {
        let snapshot = self
            .get(id)?
            .ok_or_else(|| WispError::Memory(format!("memory {id} not found")))?;

        self.ensure_vector_column(model_id)?;

        let mut updated = snapshot.clone();
        updated.vectors.insert(column.to_string(), vector.to_vec());
        updated.active_embed = Some(model_id.to_string());
        let now = Utc::now().timestamp_millis();
        updated
            .embed_versions
            .insert(model_id.to_string(), now);
        updated.updated_at = Utc
            .timestamp_millis_opt(now.max(snapshot.updated_at.timestamp_millis() + 1))
            .single()
            .unwrap_or_else(Utc::now);

        self.delete(id)?;
        if let Err(e) = self.insert_row(&updated) {
            // restore the pre-update row before surfacing the failure
            if let Err(restore) = self.insert_row(&snapshot) {
                warn!("failed to restore memory {id} after update error: {restore}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Delete expired short-term rows. Summaries and entities are
    /// retained indefinitely.
    pub fn expire_short_term(&self, retention_days: u32) -> Result<usize, WispError> {
        let cutoff =
            Utc::now().timestamp_millis() - (retention_days as i64) * 24 * 60 * 60 * 1000;
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM memories WHERE kind = 'conversation' AND created_at < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }

    /// Drop the oldest vector columns beyond `max_models`, never touching
    /// the active model's column. Column age is the newest embedding
    /// timestamp recorded for its model.
    pub fn cleanup_old_vectors(
        &self,
        max_models: usize,
        active_model: &str,
    ) -> Result<Vec<String>, WispError> {
        let columns = self.vector_columns()?;
        if columns.len() <= max_models {
            return Ok(vec![]);
        }

        let mut latest: HashMap<String, i64> = HashMap::new();
        {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT embed_versions FROM memories")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for raw in rows.flatten() {
                let versions: HashMap<String, i64> =
                    serde_json::from_str(&raw).unwrap_or_default();
                for (model, ts) in versions {
                    let slot = latest.entry(model).or_insert(ts);
                    *slot = (*slot).max(ts);
                }
            }
        }

        let active_column = model_to_column(active_model);
        let mut by_age: Vec<(i64, String)> = columns
            .iter()
            .filter(|c| **c != active_column)
            .map(|c| {
                let model = column_to_model(c).unwrap_or_default();
                (latest.get(&model).copied().unwrap_or(0), c.clone())
            })
            .collect();
        by_age.sort();

        let excess = columns.len() - max_models;
        let mut dropped = Vec::new();
        let conn = self.lock();
        for (_, column) in by_age.into_iter().take(excess) {
            conn.execute(&format!("ALTER TABLE memories DROP COLUMN \"{column}\""), [])?;
            info!("dropped stale vector column {column}");
            dropped.push(column);
        }
        Ok(dropped)
    }

    /// Append one entry to today's markdown mirror. The mirror is for
    /// humans; retrieval never reads it.
    fn append_markdown(&self, entry: &MemoryEntry) -> Result<(), WispError> {
        let day = entry.created_at.format("%Y-%m-%d");
        let path = self.dir.join("sessions").join(format!("{day}.md"));

        let tags = entry
            .metadata
            .get("tags")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", entry.kind.markdown_heading())?;
        writeln!(file)?;
        writeln!(file, "- id: {}", entry.id)?;
        writeln!(file, "- session: {}", entry.session_id)?;
        writeln!(file, "- time: {}", entry.created_at.to_rfc3339())?;
        if !tags.is_empty() {
            writeln!(file, "- tags: {tags}")?;
        }
        writeln!(file)?;
        writeln!(file, "{}", entry.content)?;
        writeln!(file)?;
        writeln!(file, "---")?;
        writeln!(file)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Run a synchronous store operation off the async executor.
pub async fn call_blocking<T, F>(
    store: std::sync::Arc<MemoryStore>,
    f: F,
) -> Result<T, WispError>
where
    T: Send + 'static,
    F: FnOnce(&MemoryStore) -> Result<T, WispError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| WispError::Memory(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (MemoryStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("wisp_memory_{}", uuid::Uuid::new_v4()));
        let store = MemoryStore::open(&dir, None).unwrap();
        (store, dir)
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    fn conversation(content: &str) -> NewMemory {
        NewMemory {
            session_id: "feishu:c1".into(),
            kind: MemoryKind::Conversation,
            content: content.into(),
            metadata: serde_json::json!({"tags": ["test"]}),
        }
    }

    #[test]
    fn test_column_codec_roundtrip() {
        for model in [
            "openai/text-embedding-3-small",
            "ollama/nomic-embed-text:v1.5",
            "deepseek/embed.large-2",
        ] {
            let column = model_to_column(model);
            assert!(column.starts_with("vector_"));
            assert!(!column.contains('/'));
            assert!(!column.contains(':'));
            assert!(!column.contains('.'));
            assert!(!column.contains('-'));
            assert_eq!(column_to_model(&column).as_deref(), Some(model));
        }
    }

    #[test]
    fn test_column_codec_rejects_foreign_names() {
        assert!(column_to_model("not_a_vector_column").is_none());
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let (store, dir) = test_store();
        let entry = store
            .insert(&conversation("user likes rust"), Some(("openai/embed-a", &[0.1, 0.2, 0.3])))
            .unwrap();

        let loaded = store.get(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.content, "user likes rust");
        assert_eq!(loaded.session_id, "feishu:c1");
        assert_eq!(loaded.kind, MemoryKind::Conversation);
        assert_eq!(loaded.active_embed.as_deref(), Some("openai/embed-a"));
        assert_eq!(loaded.metadata["tags"][0], "test");
        let column = model_to_column("openai/embed-a");
        assert_eq!(loaded.vectors[&column].len(), 3);
        assert!(loaded.embed_versions.contains_key("openai/embed-a"));
        cleanup(&dir);
    }

    #[test]
    fn test_store_without_embedding_is_fulltext_only() {
        let (store, dir) = test_store();
        let entry = store.insert(&conversation("plain record"), None).unwrap();
        let loaded = store.get(&entry.id).unwrap().unwrap();
        assert!(loaded.active_embed.is_none());
        assert!(loaded.vectors.is_empty());

        let hits = store
            .fulltext_search("plain record", 5, &Filter::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_markdown_mirror_written() {
        let (store, dir) = test_store();
        store.insert(&conversation("mirrored"), None).unwrap();
        let day = Utc::now().format("%Y-%m-%d");
        let content =
            std::fs::read_to_string(dir.join("sessions").join(format!("{day}.md"))).unwrap();
        assert!(content.contains("## 💬 对话"));
        assert!(content.contains("mirrored"));
        assert!(content.contains("- tags: test"));
        assert!(content.contains("---"));
        cleanup(&dir);
    }

    #[test]
    fn test_extract_keywords_ascii_and_digits() {
        let kws = extract_keywords("find Rust 2024 notes");
        assert!(kws.contains(&"find".to_string()));
        assert!(kws.contains(&"rust".to_string()));
        assert!(kws.contains(&"2024".to_string()));
        assert!(kws.contains(&"notes".to_string()));
        // single chars are skipped
        let kws = extract_keywords("a b");
        assert!(kws.is_empty());
    }

    #[test]
    fn test_extract_keywords_cjk_grams() {
        let kws = extract_keywords("咖啡偏好");
        assert!(kws.contains(&"咖啡".to_string()));
        assert!(kws.contains(&"啡偏".to_string()));
        assert!(kws.contains(&"偏好".to_string()));
        // ≥ 4 CJK chars also yields 3-grams
        assert!(kws.contains(&"咖啡偏".to_string()));

        let short = extract_keywords("咖啡");
        assert!(short.contains(&"咖啡".to_string()));
        assert!(!short.iter().any(|k| k.chars().count() == 3));
    }

    #[test]
    fn test_fulltext_case_insensitive() {
        let (store, dir) = test_store();
        store.insert(&conversation("User Prefers RUST"), None).unwrap();
        let lower = store
            .fulltext_search("rust", 5, &Filter::default())
            .unwrap();
        let upper = store
            .fulltext_search("RUST", 5, &Filter::default())
            .unwrap();
        assert_eq!(lower.len(), 1);
        assert_eq!(upper.len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_fulltext_scores_and_limit() {
        let (store, dir) = test_store();
        store.insert(&conversation("rust rust rust"), None).unwrap();
        store.insert(&conversation("rust once"), None).unwrap();
        store.insert(&conversation("unrelated"), None).unwrap();

        let hits = store.fulltext_search("rust", 1, &Filter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "rust rust rust");
        cleanup(&dir);
    }

    #[test]
    fn test_fulltext_regex_metacharacters_escaped() {
        let (store, dir) = test_store();
        store.insert(&conversation("version v1.2 released"), None).unwrap();
        // "." in the keyword must match literally, not any char
        let hits = store
            .fulltext_search("v1.2", 5, &Filter::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_fulltext_session_filter() {
        let (store, dir) = test_store();
        store.insert(&conversation("rust note"), None).unwrap();
        store
            .insert(
                &NewMemory {
                    session_id: "qq:g2".into(),
                    kind: MemoryKind::Conversation,
                    content: "rust note elsewhere".into(),
                    metadata: serde_json::json!({}),
                },
                None,
            )
            .unwrap();

        let filter = Filter {
            session_id: Some("qq:g2".into()),
            ..Filter::default()
        };
        let hits = store.fulltext_search("rust", 10, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "qq:g2");
        cleanup(&dir);
    }

    #[test]
    fn test_vector_search_orders_by_similarity() {
        let (store, dir) = test_store();
        let model = "openai/embed-a";
        store
            .insert(&conversation("close"), Some((model, &[1.0, 0.0, 0.0])))
            .unwrap();
        store
            .insert(&conversation("far"), Some((model, &[0.0, 1.0, 0.0])))
            .unwrap();
        store
            .insert(&conversation("middle"), Some((model, &[0.7, 0.7, 0.0])))
            .unwrap();

        let column = model_to_column(model);
        let hits = store
            .vector_search(&column, &[1.0, 0.0, 0.0], 3, &Filter::default())
            .unwrap();
        assert_eq!(hits[0].content, "close");
        assert_eq!(hits[1].content, "middle");
        assert_eq!(hits[2].content, "far");
        cleanup(&dir);
    }

    #[test]
    fn test_vector_search_dimension_mismatch_errors() {
        let (store, dir) = test_store();
        let model = "openai/embed-a";
        store
            .insert(&conversation("x"), Some((model, &[1.0, 0.0, 0.0])))
            .unwrap();
        let column = model_to_column(model);
        let err = store
            .vector_search(&column, &[1.0, 0.0], 3, &Filter::default())
            .unwrap_err();
        assert!(matches!(err, WispError::Embedding(_)));
        cleanup(&dir);
    }

    #[test]
    fn test_vector_search_empty_column_returns_empty() {
        let (store, dir) = test_store();
        store.insert(&conversation("no vectors"), None).unwrap();
        let hits = store
            .vector_search("vector_unknown_model", &[1.0], 3, &Filter::default())
            .unwrap();
        assert!(hits.is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_update_vector_invariants() {
        let (store, dir) = test_store();
        let old_model = "openai/embed-a";
        let new_model = "openai/embed-b";
        let entry = store
            .insert(&conversation("migrating"), Some((old_model, &[0.5, 0.5])))
            .unwrap();

        let new_column = store.ensure_vector_column(new_model).unwrap();
        store
            .update_vector(&entry.id, &new_column, &[0.1, 0.2, 0.3], new_model)
            .unwrap();

        let loaded = store.get(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.vectors[&new_column], vec![0.1, 0.2, 0.3]);
        // old column untouched
        assert_eq!(loaded.vectors[&model_to_column(old_model)], vec![0.5, 0.5]);
        assert_eq!(loaded.active_embed.as_deref(), Some(new_model));
        assert!(loaded.updated_at > entry.updated_at);
        assert_eq!(loaded.created_at, entry.created_at);
        assert!(loaded.embed_versions.contains_key(new_model));
        cleanup(&dir);
    }

    #[test]
    fn test_update_vector_missing_row() {
        let (store, dir) = test_store();
        let err = store
            .update_vector("missing-id", "vector_x", &[1.0], "p/m")
            .unwrap_err();
        assert!(matches!(err, WispError::Memory(_)));
        cleanup(&dir);
    }

    #[test]
    fn test_fetch_unmigrated_newest_first() {
        let (store, dir) = test_store();
        let model = "openai/embed-b";
        let a = store.insert(&conversation("oldest"), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.insert(&conversation("newest"), None).unwrap();

        let column = store.ensure_vector_column(model).unwrap();
        let batch = store.fetch_unmigrated(&column, 10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, b.id);
        assert_eq!(batch[1].id, a.id);

        store
            .update_vector(&b.id, &column, &[1.0], model)
            .unwrap();
        let batch = store.fetch_unmigrated(&column, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, a.id);
        cleanup(&dir);
    }

    #[test]
    fn test_legacy_schema_upgrade() {
        let dir = std::env::temp_dir().join(format!("wisp_legacy_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        {
            let conn = Connection::open(dir.join("wisp.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE memories (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    vector BLOB
                );",
            )
            .unwrap();
            conn.execute(
                "INSERT INTO memories (id, session_id, kind, content, created_at, updated_at, vector)
                 VALUES ('m1', 's', 'conversation', 'legacy row', 1000, 1000, ?1)",
                [vec_to_blob(&[0.25, 0.75])],
            )
            .unwrap();
        }

        let store = MemoryStore::open(&dir, Some("openai/embed-a")).unwrap();
        let columns = store.vector_columns().unwrap();
        let target = model_to_column("openai/embed-a");
        assert!(columns.contains(&target));
        assert!(!columns.iter().any(|c| c == "vector"));

        let entry = store.get("m1").unwrap().unwrap();
        assert_eq!(entry.vectors[&target], vec![0.25, 0.75]);
        assert_eq!(entry.active_embed.as_deref(), Some("openai/embed-a"));
        cleanup(&dir);
    }

    #[test]
    fn test_expire_short_term_keeps_summaries() {
        let (store, dir) = test_store();
        store.insert(&conversation("old chat"), None).unwrap();
        store
            .insert(
                &NewMemory {
                    session_id: "s".into(),
                    kind: MemoryKind::Summary,
                    content: "old summary".into(),
                    metadata: serde_json::json!({}),
                },
                None,
            )
            .unwrap();
        // backdate both rows past the cutoff
        {
            let conn = store.lock();
            conn.execute("UPDATE memories SET created_at = 1000", []).unwrap();
        }

        let removed = store.expire_short_term(7).unwrap();
        assert_eq!(removed, 1);
        let remaining = store
            .query_entries("1=1", vec![], None, None)
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, MemoryKind::Summary);
        cleanup(&dir);
    }

    #[test]
    fn test_cleanup_old_vectors_drops_stale_columns() {
        let (store, dir) = test_store();
        store
            .insert(&conversation("a"), Some(("p/old-model", &[1.0])))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .insert(&conversation("b"), Some(("p/mid-model", &[1.0])))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .insert(&conversation("c"), Some(("p/new-model", &[1.0])))
            .unwrap();
        assert_eq!(store.vector_columns().unwrap().len(), 3);

        let dropped = store.cleanup_old_vectors(2, "p/new-model").unwrap();
        assert_eq!(dropped, vec![model_to_column("p/old-model")]);
        let columns = store.vector_columns().unwrap();
        assert_eq!(columns.len(), 2);
        assert!(columns.contains(&model_to_column("p/new-model")));
        cleanup(&dir);
    }

    #[test]
    fn test_cleanup_never_drops_active_column() {
        let (store, dir) = test_store();
        store
            .insert(&conversation("a"), Some(("p/active", &[1.0])))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .insert(&conversation("b"), Some(("p/other", &[1.0])))
            .unwrap();

        // max_models=1 with the *older* column active: the newer non-active
        // column is the one that goes
        let dropped = store.cleanup_old_vectors(1, "p/active").unwrap();
        assert_eq!(dropped, vec![model_to_column("p/other")]);
        cleanup(&dir);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_count(){
        let (store, dir) = test_store();
        assert_eq!(store.count().unwrap(), 0);
        store.insert(&conversation("one"), None).unwrap();
        store.insert(&conversation("two"), None).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        cleanup(&dir);
    }
}
