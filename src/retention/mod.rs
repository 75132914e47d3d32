mod logic;
pub(crate) mod policy;

use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::errors::Result;
use crate::storage;

pub use logic::PurgeReport;
pub use policy::{compute_retention_plan, parse_duration, RetentionPlan, RetentionPolicy};

/// Public entry point for the purge operation: applies the configured
/// retention policy, deletes unreferenced part blobs, and removes purged
/// catalog entries.
pub async fn run_purge_flow(app_config: &AppConfig) -> Result<PurgeReport> {
    let policy = app_config.retention_policy()?;
    let driver =
        storage::driver_from_location(&app_config.storage_location, app_config.s3.as_ref()).await?;
    let catalog = Catalog::new(driver.clone());
    logic::run_purge(&catalog, &driver, &app_config.retry, &policy).await
}
