use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{BackupError, Result};
use crate::hash::hash_part_dir;
use crate::source::{PartDescriptor, SourceInspector, TableDescriptor};

const SCHEMA_FILE: &str = "schema.sql";

/// Source inspector over a frozen snapshot directory.
///
/// Expected layout: `<root>/<table>/<part>/<files...>` with a per-table
/// `schema.sql` next to the part directories. The snapshot is assumed
/// immutable for the duration of the backup; part checksums are computed
/// here, once, at freeze time.
pub struct FsInspector {
    root: PathBuf,
}

impl FsInspector {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn read_err(what: &str, path: &Path, e: std::io::Error) -> BackupError {
        BackupError::SourceRead(format!("{what} {}: {e}", path.display()))
    }

    fn subdirs(dir: &Path, what: &str) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| Self::read_err(what, dir, e))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::read_err(what, dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl SourceInspector for FsInspector {
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        let tables = Self::subdirs(&self.root, "list snapshot root")?
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .map(|name| TableDescriptor { name })
            .collect();
        Ok(tables)
    }

    async fn freeze_parts(&self, table: &str) -> Result<Vec<PartDescriptor>> {
        let table_dir = self.root.join(table);
        let mut parts = Vec::new();
        for part_dir in Self::subdirs(&table_dir, "list table dir")? {
            let name = match part_dir.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => continue,
            };
            let (checksum, size_bytes) =
                hash_part_dir(&part_dir).map_err(|e| Self::read_err("hash part", &part_dir, e))?;
            parts.push(PartDescriptor {
                name,
                size_bytes,
                checksum,
                local_path: part_dir,
            });
        }
        Ok(parts)
    }

    async fn get_schema(&self, table: &str) -> Result<String> {
        let path = self.root.join(table).join(SCHEMA_FILE);
        fs::read_to_string(&path).map_err(|e| Self::read_err("read schema", &path, e))
    }
}
