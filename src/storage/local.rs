use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{Result, StorageError};
use crate::storage::StorageDriver;

/// Filesystem-backed storage driver for `file://` locations and tests.
///
/// Puts go through a temp file in the destination directory followed by an
/// atomic rename, so a reader never observes a partially written object —
/// the same guarantee object stores give per-object.
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Reject storage keys that could escape the storage root.
    fn validate_key(key: &str) -> std::result::Result<(), StorageError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::Permanent(format!("unsafe storage key: '{key}'")));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(StorageError::Permanent(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> std::result::Result<PathBuf, StorageError> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let dir = path.parent().expect("resolved key always has a parent");
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.list_recursive(&path, keys)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                keys.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    fn io_err(op: &str, key: &str, e: std::io::Error) -> StorageError {
        StorageError::Permanent(format!("local {op} {key}: {e}"))
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    async fn put(&self, key: &str, data: Vec<u8>) -> std::result::Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err("put", key, e))?;
        }
        Self::atomic_write(&path, &data).map_err(|e| Self::io_err("put", key, e))
    }

    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(Self::io_err("get", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)
                    .map_err(|e| Self::io_err("list", prefix, e))?;
                keys.sort();
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Self::io_err("list", prefix, e)),
        }
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_err("exists", key, e)),
        }
    }
}
