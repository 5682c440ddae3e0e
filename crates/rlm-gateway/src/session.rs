//! Session lifecycle and per-session state (§3 `Session`/`SnippetProvenance`):
//! accessed spans, persisted chunk boundaries, filesystem handles, and
//! completion usage, all scoped to one retrieval-gateway session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rlm_core::error::{Result, RlmError};
use rlm_core::types::Usage;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One snippet surfaced to a caller, tracked against `accessed_spans` so a
/// second identical read can be flagged rather than silently repeated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetProvenance {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
    pub source_type: String,
}

impl SnippetProvenance {
    pub fn new(
        file_path: impl Into<String>,
        start_line: usize,
        end_line: usize,
        content: &str,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            start_line,
            end_line,
            content_hash: content_hash(content),
            source_type: source_type.into(),
        }
    }
}

fn content_hash(content: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Persisted chunk boundaries (§4.G "Chunk integrity"): bounds are fixed at
/// creation time and re-validated, not recomputed, on `chunk.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub strategy: String,
}

/// A stable id for a path plus the mtime+size it was created against, used
/// to invalidate chunks derived from a file that has since changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsHandle {
    pub handle_id: String,
    pub path: String,
    pub mtime_unix_secs: u64,
    pub size: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageTotals {
    pub fn record(&mut self, usage: &Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }
}

/// One retrieval-gateway session: accessed spans, chunks, handles, and
/// cumulative completion usage. Created by `session.create`, destroyed by
/// `session.close` or idle expiry.
pub struct Session {
    pub id: String,
    pub created_at_unix_secs: u64,
    pub root_prompt: Option<String>,
    accessed_spans: HashMap<String, HashSet<(usize, usize)>>,
    provenance: Vec<SnippetProvenance>,
    chunks: HashMap<String, ChunkRecord>,
    handles: HashMap<String, FsHandle>,
    pub usage: UsageTotals,
    last_touched_unix_secs: u64,
}

impl Session {
    fn new(root_prompt: Option<String>) -> Self {
        let now = now_unix_secs();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at_unix_secs: now,
            root_prompt,
            accessed_spans: HashMap::new(),
            provenance: Vec::new(),
            chunks: HashMap::new(),
            handles: HashMap::new(),
            usage: UsageTotals::default(),
            last_touched_unix_secs: now,
        }
    }

    fn touch(&mut self) {
        self.last_touched_unix_secs = now_unix_secs();
    }

    pub fn idle_secs(&self) -> u64 {
        now_unix_secs().saturating_sub(self.last_touched_unix_secs)
    }

    /// Records a span access, returning `true` if this exact `(start, end)`
    /// range was already recorded for this file (§8 property 6: "duplicate
    /// access warning, but do not block the read").
    pub fn record_span_access(
        &mut self,
        file_path: &str,
        start_line: usize,
        end_line: usize,
        content: &str,
    ) -> bool {
        self.touch();
        let spans = self.accessed_spans.entry(file_path.to_string()).or_default();
        let is_duplicate = spans.contains(&(start_line, end_line));
        spans.insert((start_line, end_line));
        self.provenance.push(SnippetProvenance::new(
            file_path, start_line, end_line, content, "span_read",
        ));
        is_duplicate
    }

    pub fn record_provenance(&mut self, provenance: SnippetProvenance) {
        self.touch();
        self.provenance.push(provenance);
    }

    pub fn provenance(&self) -> &[SnippetProvenance] {
        &self.provenance
    }

    pub fn insert_chunk(&mut self, record: ChunkRecord) {
        self.touch();
        self.chunks.insert(record.chunk_id.clone(), record);
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.chunks.get(chunk_id)
    }

    pub fn insert_handle(&mut self, handle: FsHandle) {
        self.touch();
        self.handles.insert(handle.handle_id.clone(), handle);
    }

    pub fn get_handle(&self, handle_id: &str) -> Option<&FsHandle> {
        self.handles.get(handle_id)
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Owns every live session. One instance is shared across all tool
/// invocations and transports for a gateway process.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<RwLock<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, root_prompt: Option<String>) -> String {
        let session = Session::new(root_prompt);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), Arc::new(RwLock::new(session)));
        id
    }

    pub async fn close(&self, id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RlmError::InvalidRequest(format!("unknown session: {id}")))
    }

    pub async fn get(&self, id: &str) -> Result<Arc<RwLock<Session>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RlmError::InvalidRequest(format!("unknown session: {id}")))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops sessions idle past `max_idle_secs`, returning how many were
    /// reaped.
    pub async fn reap_idle(&self, max_idle_secs: u64) -> usize {
        let mut idle_ids = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.read().await.idle_secs() >= max_idle_secs {
                    idle_ids.push(id.clone());
                }
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &idle_ids {
            sessions.remove(id);
        }
        idle_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_close_round_trips() {
        let manager = SessionManager::new();
        let id = manager.create(Some("task".to_string())).await;
        assert!(manager.get(&id).await.is_ok());
        manager.close(&id).await.unwrap();
        assert!(manager.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn closing_unknown_session_is_an_error() {
        let manager = SessionManager::new();
        let err = manager.close("nope").await.unwrap_err();
        assert!(matches!(err, RlmError::InvalidRequest(_)));
    }

    #[test]
    fn duplicate_span_access_is_flagged_but_not_blocked() {
        let mut session = Session::new(None);
        let first = session.record_span_access("a.rs", 10, 20, "fn a() {}");
        let second = session.record_span_access("a.rs", 10, 20, "fn a() {}");
        assert!(!first);
        assert!(second);
        assert_eq!(session.provenance().len(), 2);
    }

    #[test]
    fn distinct_spans_are_not_duplicates() {
        let mut session = Session::new(None);
        assert!(!session.record_span_access("a.rs", 10, 20, "x"));
        assert!(!session.record_span_access("a.rs", 21, 30, "y"));
    }

    #[tokio::test]
    async fn reap_idle_drops_sessions_past_the_threshold() {
        let manager = SessionManager::new();
        let id = manager.create(None).await;
        assert_eq!(manager.reap_idle(0).await, 1);
        assert!(manager.get(&id).await.is_err());
    }
}
