//! The twelve tools published by the retrieval gateway (§4.G): session
//! lifecycle, filesystem browsing, search, span/chunk reads, provenance
//! reporting, and `complete`. Adapted from the teacher's `Tool`/`ToolRegistry`
//! pattern in `tools.rs`, with JSON request/response bodies in place of
//! Anthropic tool-use blocks since these are served over MCP, not a chat API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rlm_core::engine::{CancellationToken, EngineConfig, RecursionEngine};
use rlm_core::error::{Result, RlmError};
use rlm_core::router::SubCallDispatcher;
use serde_json::{json, Value};

use crate::fs::SharedFileSystem;
use crate::path_validator::PathValidator;
use crate::search::{search_regex, search_substring, SearchHit};
use crate::session::{ChunkRecord, FsHandle, SessionManager, SnippetProvenance};

/// Shared dependencies every tool needs: the session table, access control,
/// the filesystem, and what `complete` dispatches sub-calls through.
pub struct GatewayState {
    pub sessions: Arc<SessionManager>,
    pub path_validator: Arc<PathValidator>,
    pub fs: SharedFileSystem,
    pub dispatcher: Arc<dyn SubCallDispatcher>,
    pub engine_config: EngineConfig,
}

#[async_trait]
pub trait GatewayTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn call(&self, params: Value) -> Result<Value>;
}

fn field<'a>(params: &'a Value, key: &str) -> Result<&'a Value> {
    params
        .get(key)
        .ok_or_else(|| RlmError::InvalidRequest(format!("missing required field '{key}'")))
}

fn string_field(params: &Value, key: &str) -> Result<String> {
    field(params, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RlmError::InvalidRequest(format!("field '{key}' must be a string")))
}

fn usize_field(params: &Value, key: &str) -> Result<usize> {
    field(params, key)?
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| RlmError::InvalidRequest(format!("field '{key}' must be a non-negative integer")))
}

fn optional_usize_field(params: &Value, key: &str, default: usize) -> usize {
    params.get(key).and_then(Value::as_u64).map(|v| v as usize).unwrap_or(default)
}

fn optional_string_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn optional_string_list(params: &Value, key: &str) -> Option<Vec<String>> {
    params.get(key)?.as_array().map(|arr| {
        arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
    })
}

// ---------------------------------------------------------------------------
// session.create / session.close
// ---------------------------------------------------------------------------

pub struct SessionCreateTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for SessionCreateTool {
    fn name(&self) -> &str {
        "session.create"
    }

    fn description(&self) -> &str {
        "Creates a new retrieval session, optionally seeded with a root prompt."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "root_prompt": { "type": "string" } },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let root_prompt = optional_string_field(&params, "root_prompt");
        let id = self.state.sessions.create(root_prompt).await;
        Ok(json!({ "session_id": id }))
    }
}

pub struct SessionCloseTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for SessionCloseTool {
    fn name(&self) -> &str {
        "session.close"
    }

    fn description(&self) -> &str {
        "Closes a retrieval session and releases its state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id"],
            "properties": { "session_id": { "type": "string" } },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        self.state.sessions.close(&session_id).await?;
        Ok(json!({ "closed": true }))
    }
}

// ---------------------------------------------------------------------------
// fs.list
// ---------------------------------------------------------------------------

pub struct FsListTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for FsListTool {
    fn name(&self) -> &str {
        "fs.list"
    }

    fn description(&self) -> &str {
        "Lists the entries of a directory within the allowed roots."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": { "path": { "type": "string" } },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let path = string_field(&params, "path")?;
        let resolved = self.state.path_validator.resolve(&path).await?;
        let entries = self
            .state
            .fs
            .list_dir(&resolved)
            .await
            .map_err(|e| RlmError::InvariantViolation(format!("cannot list '{path}': {e}")))?;
        let entries: Vec<Value> = entries
            .into_iter()
            .map(|e| json!({ "name": e.name, "is_dir": e.is_dir }))
            .collect();
        Ok(json!({ "entries": entries }))
    }
}

// ---------------------------------------------------------------------------
// fs.manifest
// ---------------------------------------------------------------------------

pub struct FsManifestTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for FsManifestTool {
    fn name(&self) -> &str {
        "fs.manifest"
    }

    fn description(&self) -> &str {
        "Walks a directory recursively, bounded by depth and file count, returning a metadata tree."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": { "type": "string" },
                "max_depth": { "type": "integer" },
                "max_files": { "type": "integer" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let path = string_field(&params, "path")?;
        let max_depth = optional_usize_field(&params, "max_depth", 8);
        let max_files = optional_usize_field(&params, "max_files", 2000);
        let root = self.state.path_validator.resolve(&path).await?;

        let mut files = Vec::new();
        let mut truncated = false;
        let mut stack = vec![(root.clone(), 0usize)];
        while let Some((dir, depth)) = stack.pop() {
            if files.len() >= max_files {
                truncated = true;
                break;
            }
            let entries = match self.state.fs.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries {
                if files.len() >= max_files {
                    truncated = true;
                    break;
                }
                if entry.is_dir {
                    if depth + 1 < max_depth {
                        stack.push((entry.path, depth + 1));
                    }
                    continue;
                }
                let meta = self.state.fs.metadata(&entry.path).await.ok();
                let relative = entry.path.strip_prefix(&root).unwrap_or(&entry.path).display().to_string();
                files.push(json!({
                    "path": relative,
                    "size": meta.as_ref().map(|m| m.len).unwrap_or(0),
                    "modified_unix_secs": meta.as_ref().map(|m| m.modified_unix_secs).unwrap_or(0),
                }));
            }
        }

        Ok(json!({ "files": files, "truncated": truncated }))
    }
}

// ---------------------------------------------------------------------------
// fs.handle.create
// ---------------------------------------------------------------------------

pub struct FsHandleCreateTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for FsHandleCreateTool {
    fn name(&self) -> &str {
        "fs.handle.create"
    }

    fn description(&self) -> &str {
        "Creates a stable handle for a path, keyed on its mtime and size, scoped to a session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "path"],
            "properties": {
                "session_id": { "type": "string" },
                "path": { "type": "string" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let path = string_field(&params, "path")?;
        let resolved = self.state.path_validator.resolve(&path).await?;
        let meta = self
            .state
            .fs
            .metadata(&resolved)
            .await
            .map_err(|e| RlmError::InvariantViolation(format!("cannot stat '{path}': {e}")))?;

        let handle_id = format!("{:x}", {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            path.hash(&mut hasher);
            meta.modified_unix_secs.hash(&mut hasher);
            meta.len.hash(&mut hasher);
            hasher.finish()
        });

        let session = self.state.sessions.get(&session_id).await?;
        let mut session = session.write().await;
        session.insert_handle(FsHandle {
            handle_id: handle_id.clone(),
            path: path.clone(),
            mtime_unix_secs: meta.modified_unix_secs,
            size: meta.len,
        });

        Ok(json!({ "handle_id": handle_id, "path": path, "size": meta.len }))
    }
}

// ---------------------------------------------------------------------------
// search.query / search.regex
// ---------------------------------------------------------------------------

fn hits_to_json(hits: Vec<SearchHit>) -> Value {
    json!({
        "matches": hits
            .into_iter()
            .map(|h| json!({
                "path": h.path,
                "line_number": h.line_number,
                "line": h.line,
                "score": h.score,
            }))
            .collect::<Vec<_>>(),
    })
}

pub struct SearchQueryTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for SearchQueryTool {
    fn name(&self) -> &str {
        "search.query"
    }

    fn description(&self) -> &str {
        "Bounded substring search across the allowed roots, scored so phrase and word-start matches rank first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": { "type": "string" },
                "path": { "type": "string" },
                "include": { "type": "array", "items": { "type": "string" } },
                "case_sensitive": { "type": "boolean" },
                "max_results": { "type": "integer" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let query = string_field(&params, "query")?;
        let path = optional_string_field(&params, "path").unwrap_or_default();
        let include = optional_string_list(&params, "include");
        let case_sensitive = params.get("case_sensitive").and_then(Value::as_bool).unwrap_or(false);
        let max_results = optional_usize_field(&params, "max_results", 50);

        let root = if path.is_empty() {
            self.state
                .path_validator
                .roots()
                .first()
                .cloned()
                .ok_or_else(|| RlmError::Config("no allowed roots configured".to_string()))?
        } else {
            self.state.path_validator.resolve(&path).await?
        };

        let hits = search_substring(&self.state.fs, &root, &query, include.as_deref(), case_sensitive, max_results).await?;
        Ok(hits_to_json(hits))
    }
}

pub struct SearchRegexTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for SearchRegexTool {
    fn name(&self) -> &str {
        "search.regex"
    }

    fn description(&self) -> &str {
        "Bounded regex search across the allowed roots, scored so phrase and word-start matches rank first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string" },
                "include": { "type": "array", "items": { "type": "string" } },
                "case_sensitive": { "type": "boolean" },
                "max_results": { "type": "integer" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let pattern = string_field(&params, "pattern")?;
        let path = optional_string_field(&params, "path").unwrap_or_default();
        let include = optional_string_list(&params, "include");
        let case_sensitive = params.get("case_sensitive").and_then(Value::as_bool).unwrap_or(false);
        let max_results = optional_usize_field(&params, "max_results", 50);

        let root = if path.is_empty() {
            self.state
                .path_validator
                .roots()
                .first()
                .cloned()
                .ok_or_else(|| RlmError::Config("no allowed roots configured".to_string()))?
        } else {
            self.state.path_validator.resolve(&path).await?
        };

        let hits = search_regex(&self.state.fs, &root, &pattern, include.as_deref(), case_sensitive, max_results).await?;
        Ok(hits_to_json(hits))
    }
}

// ---------------------------------------------------------------------------
// span.read
// ---------------------------------------------------------------------------

pub struct SpanReadTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for SpanReadTool {
    fn name(&self) -> &str {
        "span.read"
    }

    fn description(&self) -> &str {
        "Reads a line range from a file, clamped to file bounds, recording provenance against the session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "path", "start_line", "end_line"],
            "properties": {
                "session_id": { "type": "string" },
                "path": { "type": "string" },
                "start_line": { "type": "integer" },
                "end_line": { "type": "integer" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let path = string_field(&params, "path")?;
        let start_line = usize_field(&params, "start_line")?.max(1);
        let end_line = usize_field(&params, "end_line")?;

        let resolved = self.state.path_validator.resolve(&path).await?;
        let content = self
            .state
            .fs
            .read_file(&resolved)
            .await
            .map_err(|e| RlmError::InvariantViolation(format!("cannot read '{path}': {e}")))?;
        let lines: Vec<&str> = content.lines().collect();
        let clamped_end = end_line.min(lines.len());
        let clamped_start = start_line.min(clamped_end.max(1));

        let snippet = if clamped_start <= clamped_end && clamped_start >= 1 {
            lines[(clamped_start - 1)..clamped_end].join("\n")
        } else {
            String::new()
        };

        let session = self.state.sessions.get(&session_id).await?;
        let mut session = session.write().await;
        let duplicate = session.record_span_access(&path, clamped_start, clamped_end, &snippet);

        Ok(json!({
            "content": snippet,
            "start_line": clamped_start,
            "end_line": clamped_end,
            "clipped": clamped_end != end_line || clamped_start != start_line,
            "duplicate_access": duplicate,
        }))
    }
}

// ---------------------------------------------------------------------------
// chunk.create / chunk.get
// ---------------------------------------------------------------------------

pub struct ChunkCreateTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for ChunkCreateTool {
    fn name(&self) -> &str {
        "chunk.create"
    }

    fn description(&self) -> &str {
        "Persists a named chunk boundary (start/end line, size, overlap, strategy) against a file for later retrieval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "path", "start_line", "end_line"],
            "properties": {
                "session_id": { "type": "string" },
                "path": { "type": "string" },
                "start_line": { "type": "integer" },
                "end_line": { "type": "integer" },
                "overlap": { "type": "integer" },
                "strategy": { "type": "string" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let path = string_field(&params, "path")?;
        let start_line = usize_field(&params, "start_line")?;
        let end_line = usize_field(&params, "end_line")?;
        let overlap = optional_usize_field(&params, "overlap", 0);
        let strategy = optional_string_field(&params, "strategy").unwrap_or_else(|| "line_range".to_string());

        self.state.path_validator.resolve(&path).await?;

        let chunk_id = uuid::Uuid::new_v4().to_string();
        let record = ChunkRecord {
            chunk_id: chunk_id.clone(),
            file_path: path,
            start_line,
            end_line,
            chunk_size: end_line.saturating_sub(start_line) + 1,
            overlap,
            strategy,
        };

        let session = self.state.sessions.get(&session_id).await?;
        session.write().await.insert_chunk(record);

        Ok(json!({ "chunk_id": chunk_id }))
    }
}

pub struct ChunkGetTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for ChunkGetTool {
    fn name(&self) -> &str {
        "chunk.get"
    }

    fn description(&self) -> &str {
        "Reads back a persisted chunk, re-validating its bounds against the file's current size. Clipped bounds are a warning, not an error."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "chunk_id"],
            "properties": {
                "session_id": { "type": "string" },
                "chunk_id": { "type": "string" },
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let chunk_id = string_field(&params, "chunk_id")?;

        let session = self.state.sessions.get(&session_id).await?;
        let session = session.read().await;
        let record = session
            .get_chunk(&chunk_id)
            .ok_or_else(|| RlmError::InvalidRequest(format!("unknown chunk: {chunk_id}")))?
            .clone();
        drop(session);

        let resolved = self.state.path_validator.resolve(&record.file_path).await?;
        let content = self
            .state
            .fs
            .read_file(&resolved)
            .await
            .map_err(|e| RlmError::InvariantViolation(format!("cannot read '{}': {e}", record.file_path)))?;
        let lines: Vec<&str> = content.lines().collect();

        let clamped_end = record.end_line.min(lines.len());
        let clamped_start = record.start_line.min(clamped_end.max(1));
        let clipped = clamped_end != record.end_line || clamped_start != record.start_line;

        let snippet = if clamped_start >= 1 && clamped_start <= clamped_end {
            lines[(clamped_start - 1)..clamped_end].join("\n")
        } else {
            String::new()
        };

        let mut response = json!({
            "chunk_id": record.chunk_id,
            "content": snippet,
            "start_line": clamped_start,
            "end_line": clamped_end,
            "strategy": record.strategy,
        });
        if clipped {
            response["warning"] = json!("chunk bounds were clipped to the file's current size");
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// provenance.report
// ---------------------------------------------------------------------------

pub struct ProvenanceReportTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for ProvenanceReportTool {
    fn name(&self) -> &str {
        "provenance.report"
    }

    fn description(&self) -> &str {
        "Returns every snippet provenance record accumulated by a session."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id"],
            "properties": { "session_id": { "type": "string" } },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let session = self.state.sessions.get(&session_id).await?;
        let session = session.read().await;
        let records: Vec<&SnippetProvenance> = session.provenance().iter().collect();
        Ok(json!({ "provenance": records }))
    }
}

// ---------------------------------------------------------------------------
// complete
// ---------------------------------------------------------------------------

pub struct CompleteTool {
    pub state: Arc<GatewayState>,
}

#[async_trait]
impl GatewayTool for CompleteTool {
    fn name(&self) -> &str {
        "complete"
    }

    fn description(&self) -> &str {
        "Runs a recursive-inference turn against a session's accumulated context and returns its final answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "prompt"],
            "properties": {
                "session_id": { "type": "string" },
                "prompt": { "type": "string" },
                "context": {},
            },
        })
    }

    async fn call(&self, params: Value) -> Result<Value> {
        let session_id = string_field(&params, "session_id")?;
        let prompt = string_field(&params, "prompt")?;
        let context_value = params.get("context").cloned().unwrap_or(Value::Null);

        let session = self.state.sessions.get(&session_id).await?;

        let engine = RecursionEngine::new(self.state.dispatcher.clone(), self.state.engine_config.clone());
        let cancellation = CancellationToken::new();
        let result = engine.run_turn(session_id.clone(), prompt, context_value, &cancellation).await?;

        session
            .write()
            .await
            .usage
            .record(&rlm_core::types::Usage::new(0, result.tokens_used));

        Ok(json!({
            "answer": result.final_answer,
            "iterations": result.iterations_run,
            "termination_reason": result.termination_reason,
            "tokens_used": result.tokens_used,
        }))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct GatewayToolRegistry {
    tools: HashMap<String, Arc<dyn GatewayTool>>,
}

impl GatewayToolRegistry {
    pub fn new(state: Arc<GatewayState>) -> Self {
        let mut tools: HashMap<String, Arc<dyn GatewayTool>> = HashMap::new();
        let mut register = |tool: Arc<dyn GatewayTool>| {
            tools.insert(tool.name().to_string(), tool);
        };

        register(Arc::new(SessionCreateTool { state: state.clone() }));
        register(Arc::new(SessionCloseTool { state: state.clone() }));
        register(Arc::new(FsListTool { state: state.clone() }));
        register(Arc::new(FsManifestTool { state: state.clone() }));
        register(Arc::new(FsHandleCreateTool { state: state.clone() }));
        register(Arc::new(SearchQueryTool { state: state.clone() }));
        register(Arc::new(SearchRegexTool { state: state.clone() }));
        register(Arc::new(SpanReadTool { state: state.clone() }));
        register(Arc::new(ChunkCreateTool { state: state.clone() }));
        register(Arc::new(ChunkGetTool { state: state.clone() }));
        register(Arc::new(ProvenanceReportTool { state: state.clone() }));
        register(Arc::new(CompleteTool { state }));

        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn GatewayTool>> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub async fn call(&self, name: &str, params: Value) -> Result<Value> {
        match self.tools.get(name) {
            Some(tool) => tool.call(params).await,
            None => Err(RlmError::InvalidRequest(format!("tool '{name}' is not registered"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;
    use rlm_core::router::MockDispatcher;
    use rlm_core::types::LMResponse;

    fn state() -> Arc<GatewayState> {
        let fs: SharedFileSystem = Arc::new(
            MockFileSystem::new()
                .with_directory("/repo")
                .with_file("/repo/a.rs", "fn alpha() {}\nfn beta() {}\nfn gamma() {}\n"),
        );
        Arc::new(GatewayState {
            sessions: Arc::new(SessionManager::new()),
            path_validator: Arc::new(PathValidator::new(vec![PathBuf::from("/repo")], fs.clone())),
            fs,
            dispatcher: Arc::new(MockDispatcher::new(vec![LMResponse::error("no backend configured in test")])),
            engine_config: EngineConfig::default(),
        })
    }

    #[tokio::test]
    async fn session_lifecycle_round_trips() {
        let registry = GatewayToolRegistry::new(state());
        let created = registry.call("session.create", json!({})).await.unwrap();
        let session_id = created["session_id"].as_str().unwrap().to_string();
        let closed = registry.call("session.close", json!({ "session_id": session_id })).await.unwrap();
        assert_eq!(closed["closed"], json!(true));
    }

    #[tokio::test]
    async fn fs_list_returns_entries() {
        let registry = GatewayToolRegistry::new(state());
        let result = registry.call("fs.list", json!({ "path": "/repo" })).await.unwrap();
        let entries = result["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn span_read_clamps_and_flags_duplicates() {
        let registry = GatewayToolRegistry::new(state());
        let created = registry.call("session.create", json!({})).await.unwrap();
        let session_id = created["session_id"].as_str().unwrap().to_string();

        let params = json!({ "session_id": session_id, "path": "/repo/a.rs", "start_line": 1, "end_line": 100 });
        let first = registry.call("span.read", params.clone()).await.unwrap();
        assert_eq!(first["end_line"], json!(3));
        assert_eq!(first["clipped"], json!(true));
        assert_eq!(first["duplicate_access"], json!(false));

        let second = registry.call("span.read", params).await.unwrap();
        assert_eq!(second["duplicate_access"], json!(true));
    }

    #[tokio::test]
    async fn chunk_create_then_get_round_trips() {
        let registry = GatewayToolRegistry::new(state());
        let created = registry.call("session.create", json!({})).await.unwrap();
        let session_id = created["session_id"].as_str().unwrap().to_string();

        let chunk = registry
            .call("chunk.create", json!({ "session_id": session_id, "path": "/repo/a.rs", "start_line": 1, "end_line": 2 }))
            .await
            .unwrap();
        let chunk_id = chunk["chunk_id"].as_str().unwrap().to_string();

        let fetched = registry
            .call("chunk.get", json!({ "session_id": session_id, "chunk_id": chunk_id }))
            .await
            .unwrap();
        assert!(fetched.get("warning").is_none());
        assert!(fetched["content"].as_str().unwrap().contains("fn alpha"));
    }

    #[tokio::test]
    async fn chunk_get_warns_when_bounds_clip() {
        let registry = GatewayToolRegistry::new(state());
        let created = registry.call("session.create", json!({})).await.unwrap();
        let session_id = created["session_id"].as_str().unwrap().to_string();

        let chunk = registry
            .call("chunk.create", json!({ "session_id": session_id, "path": "/repo/a.rs", "start_line": 1, "end_line": 999 }))
            .await
            .unwrap();
        let chunk_id = chunk["chunk_id"].as_str().unwrap().to_string();

        let fetched = registry
            .call("chunk.get", json!({ "session_id": session_id, "chunk_id": chunk_id }))
            .await
            .unwrap();
        assert!(fetched.get("warning").is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_invalid_request() {
        let registry = GatewayToolRegistry::new(state());
        let err = registry.call("not.a.tool", json!({})).await.unwrap_err();
        assert!(matches!(err, RlmError::InvalidRequest(_)));
    }
}
