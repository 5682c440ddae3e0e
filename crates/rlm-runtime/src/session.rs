//! Session management for `rlm` runs.
//!
//! Each run gets a unique session ID and directory for isolated logging and
//! structured tracing, independent of the gateway's in-memory `Session`
//! (§3 data model) which tracks sub-call budget and provenance.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a runtime session.
///
/// Format: `YYYY-MM-DDTHH-MM-SS_XXXX` where XXXX is a short UUID suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let now = Utc::now();
        let short_uuid = &uuid::Uuid::new_v4().to_string()[..4];
        Self(format!("{}_{}", now.format("%Y-%m-%dT%H-%M-%S"), short_uuid))
    }

    #[allow(dead_code)]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[allow(dead_code)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Get the session directory path for a given session ID.
pub fn session_dir(rlm_dir: &Path, session_id: &SessionId) -> PathBuf {
    rlm_dir.join("sessions").join(&session_id.0)
}

/// Metadata about a runtime session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    /// Default sub-call backend name, if one was configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
}

impl SessionMetadata {
    pub fn new(session_id: &SessionId, work_dir: PathBuf) -> Self {
        Self { session_id: session_id.to_string(), started_at: Utc::now(), work_dir, default_backend: None }
    }

    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }
}

/// Write session metadata to the session directory.
pub fn write_metadata(session_dir: &Path, metadata: &SessionMetadata) -> anyhow::Result<()> {
    let path = session_dir.join("session.json");
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(&path, json)?;
    Ok(())
}

/// Read session metadata from a session directory.
#[allow(dead_code)]
pub fn read_metadata(session_dir: &Path) -> anyhow::Result<SessionMetadata> {
    let path = session_dir.join("session.json");
    let json = fs::read_to_string(&path)?;
    let metadata: SessionMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
