use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::catalog::{self, BackupState, Catalog, TableEntry};
use crate::config::BackupConfig;
use crate::errors::{BackupError, Result};
use crate::partstore::{DedupIndex, PartStore};
use crate::source::SourceInspector;

/// Per-table outcome of a backup run. A failed table never aborts its
/// siblings; it is recorded here and in the catalog entry.
#[derive(Debug, Clone)]
pub enum TableOutcome {
    Success {
        parts_stored: usize,
        parts_reused: usize,
        uploaded_bytes: u64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct TableBackupReport {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Debug)]
pub struct BackupResult {
    pub id: String,
    pub state: BackupState,
    pub per_table: Vec<TableBackupReport>,
}

/// Drive creation of one backup: allocate an identity, create the catalog
/// entry, enumerate tables, store each table's parts through a bounded
/// worker pool, and finalize.
pub async fn perform_backup(
    catalog: Arc<Catalog>,
    part_store: Arc<PartStore>,
    inspector: Arc<dyn SourceInspector>,
    config: &BackupConfig,
    cancel: Arc<AtomicBool>,
) -> Result<BackupResult> {
    let id = catalog::allocate_backup_id(Utc::now());
    info!("starting backup {id}");

    // Dedup view is built from the catalog as it stands before this backup
    // exists; the new entry itself is in `creating` state and never a
    // source.
    let prior = catalog.list().await?;
    let dedup = Arc::new(DedupIndex::build(
        &prior,
        config.deduplicate_age_limit,
        Utc::now(),
    ));
    info!("dedup index covers {} part identities", dedup.len());

    catalog.create(&id).await?;

    let mut tables = inspector.list_tables().await?;
    if let Some(allow) = &config.tables {
        tables.retain(|t| allow.contains(&t.name));
    }

    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut workers = JoinSet::new();

    for table in tables {
        let catalog = catalog.clone();
        let part_store = part_store.clone();
        let inspector = inspector.clone();
        let dedup = dedup.clone();
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();
        let id = id.clone();

        workers.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("backup semaphore closed");
            let outcome =
                backup_table(&catalog, &part_store, &*inspector, &dedup, &id, &table.name, &cancel)
                    .await;
            TableBackupReport {
                table: table.name,
                outcome,
            }
        });
    }

    let mut per_table = Vec::new();
    while let Some(joined) = workers.join_next().await {
        let report = joined.map_err(|e| {
            BackupError::SourceRead(format!("table worker panicked: {e}"))
        })?;
        if let TableOutcome::Failed { error } = &report.outcome {
            warn!("table {} failed: {error}", report.table);
            catalog
                .record_failed_table(&id, &report.table, error)
                .await?;
        }
        per_table.push(report);
    }
    per_table.sort_by(|a, b| a.table.cmp(&b.table));

    let state = catalog.finalize(&id).await?;
    info!("backup {id} finalized as {state}");
    Ok(BackupResult {
        id,
        state,
        per_table,
    })
}

/// Back up one table: freeze its parts, read its schema, store the parts
/// (dedup decision per part), and write the table entry into the catalog.
/// The catalog write happens only after every blob is durable.
async fn backup_table(
    catalog: &Catalog,
    part_store: &PartStore,
    inspector: &dyn SourceInspector,
    dedup: &DedupIndex,
    backup_id: &str,
    table: &str,
    cancel: &AtomicBool,
) -> TableOutcome {
    if cancel.load(Ordering::SeqCst) {
        return TableOutcome::Failed {
            error: BackupError::Cancelled(format!("table {table} skipped")).to_string(),
        };
    }

    let result: Result<TableOutcome> = async {
        let parts = inspector.freeze_parts(table).await?;
        let schema = inspector.get_schema(table).await?;

        let stored = part_store
            .store_parts(backup_id, table, &parts, dedup)
            .await?;

        let parts_reused = stored.iter().filter(|s| s.reused).count();
        let parts_stored = stored.len() - parts_reused;
        let uploaded_bytes = stored.iter().map(|s| s.uploaded_bytes).sum();

        let mut refs: Vec<_> = stored.into_iter().map(|s| s.part_ref).collect();
        catalog::sort_part_refs(&mut refs);
        catalog
            .add_table_parts(
                backup_id,
                TableEntry {
                    table: table.to_string(),
                    schema,
                    parts: refs,
                },
            )
            .await?;

        Ok(TableOutcome::Success {
            parts_stored,
            parts_reused,
            uploaded_bytes,
        })
    }
    .await;

    match result {
        Ok(outcome) => outcome,
        // a consistency error is fatal for the whole operation, but the
        // caller decides that from the recorded message; everything else is
        // a plain table-level failure
        Err(e) => TableOutcome::Failed {
            error: e.to_string(),
        },
    }
}
