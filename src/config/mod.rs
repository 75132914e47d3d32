use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;

use crate::errors::{BackupError, Result};
use crate::partstore::DEFAULT_PART_CHUNK_BYTES;
use crate::retention::{parse_duration, RetentionPolicy};
use crate::retry::RetryPolicy;

const DEFAULT_WORKERS: usize = 4;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRestoreOptions {
    pub backup_id: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRetentionOptions {
    pub keep_count: Option<usize>,
    pub keep_duration: Option<String>,
    pub deduplicate_age_limit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub storage_location: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub snapshot_dir: Option<PathBuf>,
    pub tables: Option<Vec<String>>,
    pub workers: Option<usize>,
    pub part_chunk_bytes: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub restore: Option<JsonRestoreOptions>,
    pub retention: Option<JsonRetentionOptions>,
}

/// Validated S3 credential block; present iff every field is set and
/// non-empty in config.json.
#[derive(Debug, Clone)]
pub struct S3StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Backup operation settings.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub snapshot_dir: PathBuf,
    pub tables: Option<Vec<String>>,
    pub workers: usize,
    pub part_chunk_bytes: u64,
    pub deduplicate_age_limit: Option<Duration>,
}

/// Restore operation settings.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub backup_id: String,
    pub target_dir: PathBuf,
    pub tables: Option<Vec<String>>,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage_location: String,
    pub s3: Option<S3StorageConfig>,
    pub retry: RetryPolicy,
    raw: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path).map_err(|e| {
            BackupError::InvalidInput(format!(
                "failed to read config file {}: {e}",
                config_path.display()
            ))
        })?;
        let raw: RawJsonConfig = serde_json::from_str(&content).map_err(|e| {
            BackupError::InvalidInput(format!(
                "failed to parse config file {}: {e}",
                config_path.display()
            ))
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let storage_location = raw
            .storage_location
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidInput("storage_location must be set in config.json".into())
            })?
            .clone();

        let s3 = validate_s3_config(raw.s3_storage.as_ref());
        if storage_location.starts_with("s3://") && s3.is_none() {
            return Err(BackupError::InvalidInput(
                "storage_location is an s3:// URI, but s3_storage is missing required fields \
                 (endpoint_url, region, access_key_id, secret_access_key)"
                    .into(),
            ));
        }

        let retry = raw.retry.clone().unwrap_or_default();
        Ok(Self {
            storage_location,
            s3,
            retry,
            raw,
        })
    }

    pub fn backup_config(&self) -> Result<BackupConfig> {
        let snapshot_dir = self
            .raw
            .snapshot_dir
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                BackupError::InvalidInput("snapshot_dir must be set in config.json for backup".into())
            })?
            .clone();

        let deduplicate_age_limit = self
            .raw
            .retention
            .as_ref()
            .and_then(|r| r.deduplicate_age_limit.as_deref())
            .map(parse_duration)
            .transpose()?;

        Ok(BackupConfig {
            snapshot_dir,
            tables: self.raw.tables.clone(),
            workers: self.raw.workers.unwrap_or(DEFAULT_WORKERS),
            part_chunk_bytes: self.raw.part_chunk_bytes.unwrap_or(DEFAULT_PART_CHUNK_BYTES),
            deduplicate_age_limit,
        })
    }

    pub fn restore_config(&self) -> Result<RestoreConfig> {
        let restore = self.raw.restore.as_ref().ok_or_else(|| {
            BackupError::InvalidInput("restore options must be set in config.json for restore".into())
        })?;
        let backup_id = restore
            .backup_id
            .as_ref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidInput("restore.backup_id must be set in config.json".into())
            })?
            .clone();
        let target_dir = restore
            .target_dir
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                BackupError::InvalidInput("restore.target_dir must be set in config.json".into())
            })?
            .clone();

        Ok(RestoreConfig {
            backup_id,
            target_dir,
            tables: restore.tables.clone(),
            workers: self.raw.workers.unwrap_or(DEFAULT_WORKERS),
        })
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        let retention = self.raw.retention.as_ref().ok_or_else(|| {
            BackupError::PolicyConfiguration(
                "retention options must be set in config.json for purge".into(),
            )
        })?;
        RetentionPolicy::from_options(
            retention.keep_count,
            retention.keep_duration.as_deref(),
            retention.deduplicate_age_limit.as_deref(),
        )
    }
}

fn validate_s3_config(raw: Option<&JsonS3StorageConfig>) -> Option<S3StorageConfig> {
    let raw = raw?;
    let nonempty = |s: &Option<String>| s.as_ref().filter(|v| !v.is_empty()).cloned();
    match (
        nonempty(&raw.endpoint_url),
        nonempty(&raw.region),
        nonempty(&raw.access_key_id),
        nonempty(&raw.secret_access_key),
    ) {
        (Some(endpoint_url), Some(region), Some(access_key_id), Some(secret_access_key)) => {
            Some(S3StorageConfig {
                endpoint_url,
                region,
                access_key_id,
                secret_access_key,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_from(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn file_location_needs_no_credentials() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///var/backups/parts",
            "snapshot_dir": "/var/lib/db/shadow/snap1"
        })))
        .unwrap();

        assert!(config.s3.is_none());
        let backup = config.backup_config().unwrap();
        assert_eq!(backup.workers, DEFAULT_WORKERS);
        assert_eq!(backup.part_chunk_bytes, DEFAULT_PART_CHUNK_BYTES);
        assert!(backup.tables.is_none());
    }

    #[test]
    fn s3_location_requires_complete_credentials() {
        let err = AppConfig::from_raw(raw_from(json!({
            "storage_location": "s3://bucket/prefix",
            "s3_storage": { "region": "fra1", "endpoint_url": "" }
        })))
        .err()
        .unwrap();
        assert!(matches!(err, BackupError::InvalidInput(_)));

        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "s3://bucket/prefix",
            "s3_storage": {
                "region": "fra1",
                "endpoint_url": "https://fra1.digitaloceanspaces.com",
                "access_key_id": "key",
                "secret_access_key": "secret"
            }
        })))
        .unwrap();
        assert!(config.s3.is_some());
    }

    #[test]
    fn missing_storage_location_is_rejected() {
        let err = AppConfig::from_raw(raw_from(json!({}))).err().unwrap();
        assert!(matches!(err, BackupError::InvalidInput(_)));
    }

    #[test]
    fn backup_config_reads_tuning_options() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "snapshot_dir": "/snap",
            "tables": ["events"],
            "workers": 8,
            "part_chunk_bytes": 1024,
            "retention": { "keep_count": 3, "deduplicate_age_limit": "4w" }
        })))
        .unwrap();

        let backup = config.backup_config().unwrap();
        assert_eq!(backup.workers, 8);
        assert_eq!(backup.part_chunk_bytes, 1024);
        assert_eq!(backup.tables, Some(vec!["events".to_string()]));
        assert_eq!(backup.deduplicate_age_limit, Some(Duration::weeks(4)));
    }

    #[test]
    fn backup_without_snapshot_dir_is_rejected() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups"
        })))
        .unwrap();
        let err = config.backup_config().err().unwrap();
        assert!(matches!(err, BackupError::InvalidInput(_)));
    }

    #[test]
    fn restore_config_requires_backup_id_and_target() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "restore": { "backup_id": "20240101T000000", "target_dir": "/restore" }
        })))
        .unwrap();
        let restore = config.restore_config().unwrap();
        assert_eq!(restore.backup_id, "20240101T000000");
        assert!(restore.tables.is_none());

        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "restore": { "target_dir": "/restore" }
        })))
        .unwrap();
        assert!(config.restore_config().is_err());

        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups"
        })))
        .unwrap();
        assert!(config.restore_config().is_err());
    }

    #[test]
    fn retention_policy_is_validated_at_load() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "retention": { "keep_count": 7, "keep_duration": "30d" }
        })))
        .unwrap();
        let policy = config.retention_policy().unwrap();
        assert_eq!(policy.keep_count, Some(7));
        assert_eq!(policy.keep_duration, Some(Duration::days(30)));

        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "retention": {}
        })))
        .unwrap();
        let err = config.retention_policy().err().unwrap();
        assert!(matches!(err, BackupError::PolicyConfiguration(_)));
    }

    #[test]
    fn retry_settings_default_when_absent() {
        let config = AppConfig::from_raw(raw_from(json!({
            "storage_location": "file:///backups",
            "retry": { "max_attempts": 9 }
        })))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
    }

    #[test]
    fn load_from_json_reads_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "storage_location": "file:///backups", "snapshot_dir": "/snap" }"#,
        )
        .unwrap();

        let config = AppConfig::load_from_json(&path).unwrap();
        assert_eq!(config.storage_location, "file:///backups");

        let err = AppConfig::load_from_json(&dir.path().join("missing.json"))
            .err()
            .unwrap();
        assert!(matches!(err, BackupError::InvalidInput(_)));
    }
}
