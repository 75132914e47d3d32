mod logic;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::errors::Result;
use crate::partstore::PartStore;
use crate::partstore::DEFAULT_PART_CHUNK_BYTES;
use crate::storage;

pub use logic::{RestoreResult, TableOutcome, TableRestoreReport};

/// Public entry point for the restore process: reconstructs a backup's
/// tables (schema files plus verified data parts) into the target
/// directory.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    cancel: Arc<AtomicBool>,
) -> Result<RestoreResult> {
    let restore_config = app_config.restore_config()?;
    let driver =
        storage::driver_from_location(&app_config.storage_location, app_config.s3.as_ref()).await?;
    let catalog = Arc::new(Catalog::new(driver.clone()));
    let part_store = Arc::new(PartStore::new(
        driver,
        app_config.retry.clone(),
        DEFAULT_PART_CHUNK_BYTES,
    ));

    logic::perform_restore(catalog, part_store, &restore_config, cancel).await
}
