use thiserror::Error;

/// Error produced by a storage driver for a single blob operation.
///
/// The classification decides retry behavior: `Transient` errors are retried
/// by the retry policy, everything else escalates immediately.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("permanent storage error: {0}")]
    Permanent(String),

    #[error("object not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("source read error: {0}")]
    SourceRead(String),

    #[error("catalog consistency error: {0}")]
    CatalogConsistency(String),

    #[error("invalid retention policy: {0}")]
    PolicyConfiguration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Backup not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
