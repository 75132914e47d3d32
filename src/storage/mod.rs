pub(crate) mod local;
pub(crate) mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::config::S3StorageConfig;
use crate::errors::{BackupError, Result, StorageError};

pub use local::LocalDriver;
pub use s3::S3Driver;

/// Narrow interface to the remote blob store. Keys are `/`-separated paths
/// relative to the configured storage location; every object is written and
/// read whole, which is what gives catalog records their single-object
/// atomicity.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> std::result::Result<(), StorageError>;
    async fn get(&self, key: &str) -> std::result::Result<Vec<u8>, StorageError>;
    async fn delete(&self, key: &str) -> std::result::Result<(), StorageError>;
    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError>;
    async fn exists(&self, key: &str) -> std::result::Result<bool, StorageError>;
}

/// Build a storage driver from the configured location URI.
///
/// `s3://bucket/prefix` requires the `s3_storage` section of config.json for
/// credentials and endpoint; `file:///path` needs nothing else.
pub async fn driver_from_location(
    location: &str,
    s3_config: Option<&S3StorageConfig>,
) -> Result<Arc<dyn StorageDriver>> {
    let url = Url::parse(location)
        .map_err(|e| BackupError::InvalidInput(format!("invalid storage_location '{location}': {e}")))?;

    match url.scheme() {
        "s3" => {
            let cfg = s3_config.ok_or_else(|| {
                BackupError::InvalidInput(
                    "storage_location is an s3:// URI but s3_storage is not configured".into(),
                )
            })?;
            let bucket = url
                .host_str()
                .ok_or_else(|| BackupError::InvalidInput("s3:// URI missing bucket name".into()))?
                .to_string();
            let prefix = url.path().trim_matches('/').to_string();
            Ok(Arc::new(S3Driver::connect(cfg, bucket, prefix).await))
        }
        "file" => {
            let root = url
                .to_file_path()
                .map_err(|_| BackupError::InvalidInput(format!("invalid file:// URI: {location}")))?;
            Ok(Arc::new(LocalDriver::new(&root)?))
        }
        other => Err(BackupError::InvalidInput(format!(
            "unsupported storage_location scheme '{other}' (expected s3:// or file://)"
        ))),
    }
}
