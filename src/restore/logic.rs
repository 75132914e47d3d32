use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::catalog::{Catalog, TableEntry};
use crate::config::RestoreConfig;
use crate::errors::{BackupError, Result};
use crate::partstore::PartStore;

/// Per-table outcome of a restore. A table aborts on its first failed part;
/// sibling tables continue.
#[derive(Debug, Clone)]
pub enum TableOutcome {
    Success { parts_fetched: usize },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct TableRestoreReport {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug)]
pub struct RestoreResult {
    pub backup_id: String,
    pub per_table: Vec<TableRestoreReport>,
}

/// Restore a backup into the target directory: per table, materialize the
/// captured schema under `schema/<table>.sql` and every referenced part
/// under `data/<table>/<part>/`, verifying checksums on the way in.
pub async fn perform_restore(
    catalog: Arc<Catalog>,
    part_store: Arc<PartStore>,
    config: &RestoreConfig,
    cancel: Arc<AtomicBool>,
) -> Result<RestoreResult> {
    let meta = catalog
        .try_get(&config.backup_id)
        .await?
        .ok_or_else(|| BackupError::NotFound(config.backup_id.clone()))?;

    if !meta.state.is_terminal() {
        return Err(BackupError::InvalidInput(format!(
            "backup {} is in state {} and cannot be restored",
            meta.id, meta.state
        )));
    }
    info!("restoring backup {} ({} tables)", meta.id, meta.tables.len());

    if !meta.failed_tables.is_empty() {
        warn!(
            "backup {} is partially failed; tables missing from it: {}",
            meta.id,
            meta.failed_tables
                .iter()
                .map(|f| f.table.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut tables: Vec<TableEntry> = meta.tables;
    if let Some(allow) = &config.tables {
        tables.retain(|t| allow.contains(&t.table));
    }

    fs::create_dir_all(config.target_dir.join("schema"))?;
    fs::create_dir_all(config.target_dir.join("data"))?;

    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut workers = JoinSet::new();

    for table in tables {
        let part_store = part_store.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let target_dir = config.target_dir.clone();

        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("restore semaphore closed");
            let name = table.table.clone();
            let outcome = restore_table(&part_store, &table, &target_dir, &cancel).await;
            TableRestoreReport {
                table: name,
                outcome,
            }
        });
    }

    let mut per_table = Vec::new();
    while let Some(joined) = workers.join_next().await {
        let report = joined.map_err(|e| {
            BackupError::SourceRead(format!("restore worker panicked: {e}"))
        })?;
        if let TableOutcome::Failed { error } = &report.outcome {
            warn!("restore of table {} failed: {error}", report.table);
        }
        per_table.push(report);
    }
    per_table.sort_by(|a, b| a.table.cmp(&b.table));

    Ok(RestoreResult {
        backup_id: meta.id,
        per_table,
    })
}

async fn restore_table(
    part_store: &PartStore,
    table: &TableEntry,
    target_dir: &std::path::Path,
    cancel: &AtomicBool,
) -> TableOutcome {
    if cancel.load(Ordering::SeqCst) {
        return TableOutcome::Failed {
            error: BackupError::Cancelled(format!("table {} skipped", table.table)).to_string(),
        };
    }

    let result: Result<usize> = async {
        let schema_path = target_dir.join("schema").join(format!("{}.sql", table.table));
        fs::write(&schema_path, &table.schema)?;

        let table_data_dir = target_dir.join("data").join(&table.table);
        part_store
            .fetch_parts(&table.table, &table.parts, &table_data_dir)
            .await?;
        Ok(table.parts.len())
    }
    .await;

    match result {
        Ok(parts_fetched) => TableOutcome::Success { parts_fetched },
        Err(e) => TableOutcome::Failed {
            error: e.to_string(),
        },
    }
}
