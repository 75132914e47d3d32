use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::catalog::{BackupMeta, BackupState, FailedTable, TableEntry};
use crate::errors::{BackupError, Result, StorageError};
use crate::storage::StorageDriver;

const CATALOG_PREFIX: &str = "catalog/";

/// The persisted backup catalog: one JSON record per backup under
/// `catalog/<id>.json`, written whole through the storage driver so readers
/// never observe a half-written entry.
///
/// Mutations to a single entry are serialized through a per-identity async
/// mutex; different identities proceed fully in parallel. The lock map is
/// in-process, which matches the single-operator deployment model — the
/// storage driver's per-object atomicity protects readers either way.
pub struct Catalog {
    driver: Arc<dyn StorageDriver>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn record_key(id: &str) -> String {
    format!("{CATALOG_PREFIX}{id}.json")
}

impl Catalog {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            driver,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn entry_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("catalog lock map poisoned");
        locks.entry(id.to_string()).or_default().clone()
    }

    async fn load(&self, id: &str) -> Result<Option<BackupMeta>> {
        match self.driver.get(&record_key(id)).await {
            Ok(data) => {
                let meta: BackupMeta = serde_json::from_slice(&data).map_err(|e| {
                    BackupError::CatalogConsistency(format!("undecodable catalog entry {id}: {e}"))
                })?;
                if meta.id != id {
                    return Err(BackupError::CatalogConsistency(format!(
                        "catalog entry {id} claims id {}",
                        meta.id
                    )));
                }
                Ok(Some(meta))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, meta: &BackupMeta) -> Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        self.driver.put(&record_key(&meta.id), data).await?;
        Ok(())
    }

    /// Create a new entry in `creating` state. The id must be unused.
    pub async fn create(&self, id: &str) -> Result<BackupMeta> {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        if self.load(id).await?.is_some() {
            return Err(BackupError::InvalidInput(format!(
                "backup {id} already exists in the catalog"
            )));
        }
        let meta = BackupMeta::new(id, Utc::now());
        self.save(&meta).await?;
        debug!("catalog: created entry {id}");
        Ok(meta)
    }

    /// Attach one finished table's parts to an in-progress backup.
    pub async fn add_table_parts(&self, id: &str, entry: TableEntry) -> Result<()> {
        self.mutate_creating(id, |meta| {
            meta.tables.push(entry);
            Ok(())
        })
        .await
    }

    /// Record a table-level failure against an in-progress backup.
    pub async fn record_failed_table(&self, id: &str, table: &str, error: &str) -> Result<()> {
        let failed = FailedTable {
            table: table.to_string(),
            error: error.to_string(),
        };
        self.mutate_creating(id, |meta| {
            meta.failed_tables.push(failed);
            Ok(())
        })
        .await
    }

    /// Finish an in-progress backup: `created` when every table completed,
    /// `partially_failed` when any table was recorded as failed.
    pub async fn finalize(&self, id: &str) -> Result<BackupState> {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        let mut meta = self.require(id).await?;
        if meta.state != BackupState::Creating {
            return Err(BackupError::CatalogConsistency(format!(
                "cannot finalize backup {id} in state {}",
                meta.state
            )));
        }
        meta.state = if meta.failed_tables.is_empty() {
            BackupState::Created
        } else {
            BackupState::PartiallyFailed
        };
        meta.end_time = Some(Utc::now());
        self.save(&meta).await?;
        debug!("catalog: finalized {id} as {}", meta.state);
        Ok(meta.state)
    }

    pub async fn try_get(&self, id: &str) -> Result<Option<BackupMeta>> {
        self.load(id).await
    }

    pub async fn get(&self, id: &str) -> Result<BackupMeta> {
        self.require(id).await
    }

    /// All catalog entries in ascending id (= chronological) order. Entries
    /// purged between the listing and the read are skipped.
    pub async fn list(&self) -> Result<Vec<BackupMeta>> {
        let mut keys = self.driver.list(CATALOG_PREFIX).await?;
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let id = match key
                .strip_prefix(CATALOG_PREFIX)
                .and_then(|k| k.strip_suffix(".json"))
            {
                Some(id) => id,
                None => continue,
            };
            if let Some(meta) = self.load(id).await? {
                entries.push(meta);
            }
        }
        Ok(entries)
    }

    /// Move a terminal entry into `deleting` state. Idempotent for entries
    /// already deleting; illegal for entries still being created.
    pub async fn mark_deleting(&self, id: &str) -> Result<()> {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        let mut meta = self.require(id).await?;
        match meta.state {
            BackupState::Deleting => Ok(()),
            BackupState::Created | BackupState::PartiallyFailed => {
                meta.state = BackupState::Deleting;
                self.save(&meta).await?;
                debug!("catalog: marked {id} deleting");
                Ok(())
            }
            BackupState::Creating => Err(BackupError::CatalogConsistency(format!(
                "cannot mark backup {id} deleting while it is still creating"
            ))),
        }
    }

    /// Remove the record of a `deleting` entry. The caller (the retention
    /// engine) is responsible for having deleted or re-verified every blob
    /// the entry references first.
    pub async fn purge(&self, id: &str) -> Result<()> {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        let meta = self.require(id).await?;
        if meta.state != BackupState::Deleting {
            return Err(BackupError::CatalogConsistency(format!(
                "cannot purge backup {id} in state {} (must be deleting)",
                meta.state
            )));
        }
        self.driver.delete(&record_key(id)).await?;
        debug!("catalog: purged {id}");
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<BackupMeta> {
        self.load(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Read-modify-write of an entry that must still be in `creating` state.
    async fn mutate_creating<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BackupMeta) -> Result<()>,
    {
        let lock = self.entry_lock(id);
        let _guard = lock.lock().await;

        let mut meta = self.require(id).await?;
        if meta.state != BackupState::Creating {
            return Err(BackupError::CatalogConsistency(format!(
                "cannot mutate backup {id} in state {} (must be creating)",
                meta.state
            )));
        }
        mutate(&mut meta)?;
        self.save(&meta).await?;
        Ok(())
    }
}
