mod logic;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::errors::Result;
use crate::partstore::PartStore;
use crate::source::FsInspector;
use crate::storage;

pub use logic::{perform_backup, BackupResult, TableBackupReport, TableOutcome};

/// Public entry point for the backup process: wires the configured storage
/// driver, source inspector, catalog and part store together and runs the
/// orchestration.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    cancel: Arc<AtomicBool>,
) -> Result<BackupResult> {
    let backup_config = app_config.backup_config()?;
    let driver =
        storage::driver_from_location(&app_config.storage_location, app_config.s3.as_ref()).await?;
    let catalog = Arc::new(Catalog::new(driver.clone()));
    let part_store = Arc::new(PartStore::new(
        driver,
        app_config.retry.clone(),
        backup_config.part_chunk_bytes,
    ));
    let inspector = Arc::new(FsInspector::new(&backup_config.snapshot_dir));

    logic::perform_backup(catalog, part_store, inspector, &backup_config, cancel).await
}
