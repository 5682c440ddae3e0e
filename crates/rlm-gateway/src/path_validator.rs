//! Access control for file-touching tools (§4.G "Access control"): rejects
//! path traversal, resolves symlinks, and rejects targets outside the
//! configured roots or matching a restricted-name pattern.
//!
//! Grounded on `fs_tools.rs`'s `resolve_path` (canonicalize-and-`starts_with`
//! containment check), generalized from a single root to "member of any
//! configured root".

use std::path::{Component, Path, PathBuf};

use rlm_core::error::{Result, RlmError};

use crate::fs::SharedFileSystem;

/// Path components that are never allowed to resolve, anywhere under any
/// root (§4.G: `.git`, `__pycache__`, `.venv`, `node_modules`, `.env`,
/// `secrets`, `credentials`, …).
const RESTRICTED_NAMES: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "node_modules",
    ".env",
    "secrets",
    "credentials",
    ".ssh",
    ".aws",
];

#[derive(Clone)]
pub struct PathValidator {
    roots: Vec<PathBuf>,
    fs: SharedFileSystem,
}

impl PathValidator {
    pub fn new(roots: Vec<PathBuf>, fs: SharedFileSystem) -> Self {
        Self { roots, fs }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn is_restricted(path: &Path) -> bool {
        path.components().any(|c| match c {
            Component::Normal(name) => RESTRICTED_NAMES
                .iter()
                .any(|restricted| name.eq_ignore_ascii_case(restricted)),
            _ => false,
        })
    }

    /// Resolves `path` (absolute, or relative to the first configured root)
    /// and checks it against every configured root; "allowed" is membership
    /// in *any* of them. Does not require the path to exist — callers that
    /// need an existing file canonicalize again via the filesystem.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf> {
        if Self::is_restricted(Path::new(path)) {
            return Err(RlmError::InvariantViolation(format!(
                "path '{path}' matches a restricted name pattern"
            )));
        }

        let requested = Path::new(path);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.roots
                .first()
                .ok_or_else(|| RlmError::Config("no allowed roots configured".to_string()))?
                .join(requested)
        };

        for root in &self.roots {
            let root_canonical = self
                .fs
                .canonicalize(root)
                .await
                .map_err(|e| RlmError::Config(format!("cannot resolve root {root:?}: {e}")))?;

            if let Ok(canonical) = self.fs.canonicalize(&candidate).await {
                if canonical.starts_with(&root_canonical) {
                    if Self::is_restricted(&canonical) {
                        return Err(RlmError::InvariantViolation(format!(
                            "path '{path}' matches a restricted name pattern"
                        )));
                    }
                    return Ok(canonical);
                }
                continue;
            }

            // Non-existent target: validate via its parent so callers can
            // still resolve write/create targets.
            if let Some(parent) = candidate.parent() {
                if let Ok(parent_canonical) = self.fs.canonicalize(parent).await {
                    if parent_canonical.starts_with(&root_canonical) {
                        return Ok(candidate.clone());
                    }
                }
            }
        }

        Err(RlmError::InvariantViolation(format!(
            "path '{path}' is outside the allowed roots"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;
    use std::sync::Arc;

    fn validator() -> PathValidator {
        let fs = MockFileSystem::new()
            .with_directory("/workspace")
            .with_file("/workspace/src/lib.rs", "fn main() {}")
            .with_directory("/workspace/.git")
            .with_file("/workspace/.git/config", "secret");
        PathValidator::new(vec![PathBuf::from("/workspace")], Arc::new(fs))
    }

    #[tokio::test]
    async fn resolves_paths_inside_the_root() {
        let v = validator();
        let resolved = v.resolve("src/lib.rs").await.unwrap();
        assert_eq!(resolved, PathBuf::from("/workspace/src/lib.rs"));
    }

    #[tokio::test]
    async fn rejects_restricted_names() {
        let v = validator();
        let err = v.resolve(".git/config").await.unwrap_err();
        assert!(matches!(err, RlmError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn rejects_paths_outside_any_root() {
        let v = validator();
        let err = v.resolve("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, RlmError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn membership_in_any_configured_root_is_allowed() {
        let fs = Arc::new(
            MockFileSystem::new()
                .with_directory("/a")
                .with_directory("/b")
                .with_file("/b/file.txt", "hi"),
        );
        let v = PathValidator::new(vec![PathBuf::from("/a"), PathBuf::from("/b")], fs);
        let resolved = v.resolve("/b/file.txt").await.unwrap();
        assert_eq!(resolved, PathBuf::from("/b/file.txt"));
    }
}
