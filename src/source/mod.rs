pub(crate) mod fs;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::Result;

pub use fs::FsInspector;

/// A table discovered in the source snapshot.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
}

/// An immutable data part as seen on local disk at snapshot time.
#[derive(Debug, Clone)]
pub struct PartDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub local_path: PathBuf,
}

/// Read-only view of the database instance being backed up: which tables
/// exist, their schema text, and the frozen data parts per table.
#[async_trait]
pub trait SourceInspector: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>>;
    async fn freeze_parts(&self, table: &str) -> Result<Vec<PartDescriptor>>;
    async fn get_schema(&self, table: &str) -> Result<String>;
}
