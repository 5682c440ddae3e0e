//! Virtual filesystem abstraction for testability.
//!
//! Abstracts filesystem operations so `fs.*`/`search.*`/`span.read`/`chunk.*`
//! tools can be tested against an in-memory filesystem instead of real
//! files. Adapted near-verbatim from the teacher's `fs.rs`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &Path) -> io::Result<String>;
    async fn read_file_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;
    async fn write_file(&self, path: &Path, content: &str) -> io::Result<()>;
    async fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    async fn exists(&self, path: &Path) -> bool;
    async fn is_dir(&self, path: &Path) -> bool;
    async fn is_file(&self, path: &Path) -> bool;
    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata>;
    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub name: String,
    pub is_dir: bool,
}

/// File metadata, including mtime — needed by `fs.handle.create`'s
/// mtime+size identity.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub len: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub modified_unix_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for RealFileSystem {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn read_file_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_file(&self, path: &Path, content: &str) -> io::Result<()> {
        tokio::fs::write(path, content).await
    }

    async fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await?;
            entries.push(DirEntry {
                path,
                name,
                is_dir: file_type.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    async fn is_file(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
    }

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        let meta = tokio::fs::metadata(path).await?;
        let modified_unix_secs = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(FileMetadata {
            len: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            modified_unix_secs,
        })
    }

    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::canonicalize(path).await
    }
}

/// Mock filesystem for testing; stores files in memory and tracks writes.
#[derive(Debug, Clone)]
pub struct MockFileSystem {
    files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
    directories: Arc<RwLock<HashMap<PathBuf, ()>>>,
    written_files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
}

impl Default for MockFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            directories: Arc::new(RwLock::new(HashMap::new())),
            written_files: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.ensure_parent_dirs(parent);
        }
        self.files.write().unwrap().insert(path, content.into().into_bytes());
        self
    }

    pub fn with_directory(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.ensure_parent_dirs(&path);
        self.directories.write().unwrap().insert(path, ());
        self
    }

    pub fn get_written_file(&self, path: &Path) -> Option<String> {
        self.written_files
            .read()
            .unwrap()
            .get(path)
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    }

    fn ensure_parent_dirs(&self, path: &Path) {
        let mut current = path.to_path_buf();
        let mut dirs_to_add = Vec::new();
        while current.parent().is_some() {
            dirs_to_add.push(current.clone());
            current = current.parent().unwrap().to_path_buf();
            if current.as_os_str().is_empty() {
                break;
            }
        }
        let mut directories = self.directories.write().unwrap();
        for dir in dirs_to_add {
            directories.insert(dir, ());
        }
    }

    fn normalize_path(&self, path: &Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::CurDir => {}
                std::path::Component::ParentDir => {
                    components.pop();
                }
                _ => components.push(component),
            }
        }
        components.iter().collect()
    }
}

#[async_trait]
impl FileSystem for MockFileSystem {
    async fn read_file(&self, path: &Path) -> io::Result<String> {
        let normalized = self.normalize_path(path);
        self.files
            .read()
            .unwrap()
            .get(&normalized)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("file not found: {path:?}")))
    }

    async fn read_file_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        let normalized = self.normalize_path(path);
        self.files
            .read()
            .unwrap()
            .get(&normalized)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("file not found: {path:?}")))
    }

    async fn write_file(&self, path: &Path, content: &str) -> io::Result<()> {
        let normalized = self.normalize_path(path);
        let bytes = content.as_bytes().to_vec();
        self.files.write().unwrap().insert(normalized.clone(), bytes.clone());
        self.written_files.write().unwrap().insert(normalized, bytes);
        Ok(())
    }

    async fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let normalized = self.normalize_path(path);
        if !self.is_dir(&normalized).await {
            return Err(io::Error::new(ErrorKind::NotFound, format!("directory not found: {path:?}")));
        }
        let files = self.files.read().unwrap();
        let directories = self.directories.read().unwrap();
        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for file_path in files.keys() {
            if file_path.parent() == Some(normalized.as_path()) {
                let name = file_path.file_name().unwrap().to_string_lossy().to_string();
                if seen.insert(name.clone()) {
                    entries.push(DirEntry {
                        path: file_path.clone(),
                        name,
                        is_dir: false,
                    });
                }
            }
        }
        for dir_path in directories.keys() {
            if dir_path.parent() == Some(normalized.as_path()) && dir_path != &normalized {
                let name = dir_path.file_name().unwrap().to_string_lossy().to_string();
                if seen.insert(name.clone()) {
                    entries.push(DirEntry {
                        path: dir_path.clone(),
                        name,
                        is_dir: true,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn exists(&self, path: &Path) -> bool {
        let normalized = self.normalize_path(path);
        self.files.read().unwrap().contains_key(&normalized)
            || self.directories.read().unwrap().contains_key(&normalized)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.directories.read().unwrap().contains_key(&self.normalize_path(path))
    }

    async fn is_file(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(&self.normalize_path(path))
    }

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        let normalized = self.normalize_path(path);
        if let Some(bytes) = self.files.read().unwrap().get(&normalized) {
            return Ok(FileMetadata {
                len: bytes.len() as u64,
                is_dir: false,
                is_file: true,
                modified_unix_secs: 0,
            });
        }
        if self.directories.read().unwrap().contains_key(&normalized) {
            return Ok(FileMetadata {
                len: 0,
                is_dir: true,
                is_file: false,
                modified_unix_secs: 0,
            });
        }
        Err(io::Error::new(ErrorKind::NotFound, format!("path not found: {path:?}")))
    }

    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let normalized = self.normalize_path(path);
        if self.exists(&normalized).await {
            Ok(normalized)
        } else {
            Err(io::Error::new(ErrorKind::NotFound, format!("path not found: {path:?}")))
        }
    }
}

pub type SharedFileSystem = Arc<dyn FileSystem>;
