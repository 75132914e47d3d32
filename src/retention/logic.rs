use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::catalog::{BackupMeta, BackupState, Catalog};
use crate::errors::Result;
use crate::retention::policy::{compute_retention_plan, RetentionPolicy};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::StorageDriver;

/// Summary of one GC run.
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Catalog entries removed.
    pub deleted_backups: Vec<String>,
    /// Storage keys physically deleted.
    pub deleted_parts: usize,
    /// Storage keys intentionally skipped because a live backup still
    /// references them.
    pub skipped_parts: usize,
    /// Storage keys whose deletion failed; they stay behind with their
    /// entry still in `deleting` state for the next run.
    pub failed_deletes: Vec<String>,
}

/// Storage keys referenced by entries that are NOT being deleted, including
/// `creating` entries — an in-flight backup's references protect its blobs.
fn live_keys(entries: &[BackupMeta]) -> HashSet<String> {
    entries
        .iter()
        .filter(|e| e.state != BackupState::Deleting)
        .flat_map(|e| e.storage_keys().map(str::to_string))
        .collect()
}

/// Execute retention: plan, durably mark victims `deleting`, recompute part
/// reference counts from a fresh catalog read, physically delete
/// unreferenced blobs, and purge fully-cleaned entries.
///
/// Reference counts are recomputed from current catalog state at deletion
/// time, never trusted from the plan: a backup created concurrently with
/// this run re-protects any blob it references (the purge-time re-check of
/// the plan/purge split).
pub async fn run_purge(
    catalog: &Catalog,
    driver: &Arc<dyn StorageDriver>,
    retry: &RetryPolicy,
    policy: &RetentionPolicy,
) -> Result<PurgeReport> {
    let now = Utc::now();
    let entries = catalog.list().await?;
    let plan = compute_retention_plan(&entries, policy, now);
    info!(
        "retention plan: keep {}, delete {}",
        plan.keep.len(),
        plan.delete.len()
    );

    let mut report = PurgeReport::default();
    if plan.delete.is_empty() {
        return Ok(report);
    }

    // Durable state transition first: once an entry is `deleting` it stops
    // counting toward reference counts and stops being a dedup source, even
    // if this run dies before touching any blob.
    for id in &plan.delete {
        catalog.mark_deleting(id).await?;
    }

    // Fresh read after marking: whatever was created in the meantime is in
    // here with its references intact.
    let entries = catalog.list().await?;
    let live = live_keys(&entries);
    let deleting: Vec<&BackupMeta> = entries
        .iter()
        .filter(|e| e.state == BackupState::Deleting)
        .collect();

    // Per-key resolution across all deleting entries. A key shared by two
    // deleting entries is deleted once; a key any live entry references is
    // skipped for every deleting entry that carries it.
    let mut resolved: HashMap<String, bool> = HashMap::new(); // key -> delete succeeded or skipped
    for entry in &deleting {
        for key in entry.storage_keys() {
            if resolved.contains_key(key) {
                continue;
            }
            if live.contains(key) {
                report.skipped_parts += 1;
                resolved.insert(key.to_string(), true);
                continue;
            }
            match with_retry(retry, "part delete", || driver.delete(key)).await {
                Ok(()) => {
                    report.deleted_parts += 1;
                    resolved.insert(key.to_string(), true);
                }
                Err(e) => {
                    warn!("failed to delete part blob {key}: {e}; will retry next run");
                    report.failed_deletes.push(key.to_string());
                    resolved.insert(key.to_string(), false);
                }
            }
        }
    }

    // Purge entries whose every key is resolved (deleted or intentionally
    // skipped). An entry with a failed delete stays `deleting` for the next
    // run to finish.
    for entry in &deleting {
        let fully_resolved = entry
            .storage_keys()
            .all(|key| resolved.get(key).copied().unwrap_or(false));
        if fully_resolved {
            catalog.purge(&entry.id).await?;
            report.deleted_backups.push(entry.id.clone());
        } else {
            warn!(
                "backup {} left in deleting state: some part deletions failed",
                entry.id
            );
        }
    }

    info!(
        "purge complete: {} backups removed, {} parts deleted, {} skipped, {} failed",
        report.deleted_backups.len(),
        report.deleted_parts,
        report.skipped_parts,
        report.failed_deletes.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PartRef, TableEntry};
    use crate::storage::LocalDriver;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<dyn StorageDriver>,
        catalog: Catalog,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let driver: Arc<dyn StorageDriver> = Arc::new(LocalDriver::new(dir.path()).unwrap());
        let catalog = Catalog::new(driver.clone());
        Fixture {
            _dir: dir,
            driver,
            catalog,
        }
    }

    /// Create a finalized backup whose parts either upload fresh blobs or
    /// reuse the given prior keys.
    async fn seed_backup(fx: &Fixture, id: &str, table: &str, parts: &[(&str, Option<&str>)]) {
        fx.catalog.create(id).await.unwrap();
        let mut refs = Vec::new();
        for (name, reuse_key) in parts {
            let (key, link) = match reuse_key {
                Some(existing) => ((*existing).to_string(), Some("origin".to_string())),
                None => {
                    let key = format!("data/{id}/{table}/{name}.tar.gz");
                    fx.driver.put(&key, b"blob".to_vec()).await.unwrap();
                    (key, None)
                }
            };
            refs.push(PartRef {
                name: (*name).to_string(),
                checksum: format!("sum-{name}"),
                size_bytes: 4,
                paths: vec![key],
                link,
            });
        }
        fx.catalog
            .add_table_parts(
                id,
                TableEntry {
                    table: table.to_string(),
                    schema: String::new(),
                    parts: refs,
                },
            )
            .await
            .unwrap();
        fx.catalog.finalize(id).await.unwrap();
    }

    #[tokio::test]
    async fn keep_count_deletes_old_backups_but_not_shared_parts() {
        let fx = fixture();
        // B1 uploads p1, p2; B3 reuses p1; B2 is independent
        seed_backup(&fx, "20240101T000000", "t", &[("p1_1_1_0", None), ("p2_1_1_0", None)]).await;
        seed_backup(&fx, "20240102T000000", "t", &[("p3_1_1_0", None)]).await;
        seed_backup(
            &fx,
            "20240103T000000",
            "t",
            &[("p1_1_1_0", Some("data/20240101T000000/t/p1_1_1_0.tar.gz"))],
        )
        .await;

        let policy = RetentionPolicy::from_options(Some(1), None, None).unwrap();
        let report = run_purge(&fx.catalog, &fx.driver, &fast_retry(), &policy)
            .await
            .unwrap();

        assert_eq!(
            report.deleted_backups,
            vec!["20240101T000000", "20240102T000000"]
        );
        // p1 is shared with the retained B3: must survive
        assert!(fx
            .driver
            .exists("data/20240101T000000/t/p1_1_1_0.tar.gz")
            .await
            .unwrap());
        // p2 and p3 were only referenced by deleted backups: gone
        assert!(!fx
            .driver
            .exists("data/20240101T000000/t/p2_1_1_0.tar.gz")
            .await
            .unwrap());
        assert!(!fx
            .driver
            .exists("data/20240102T000000/t/p3_1_1_0.tar.gz")
            .await
            .unwrap());
        assert_eq!(report.skipped_parts, 1);
        assert_eq!(report.deleted_parts, 2);
        assert!(report.failed_deletes.is_empty());

        let remaining = fx.catalog.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "20240103T000000");
    }

    #[tokio::test]
    async fn backup_created_after_plan_protects_its_parts() {
        let fx = fixture();
        seed_backup(&fx, "20240101T000000", "t", &[("p1_1_1_0", None), ("p2_1_1_0", None)]).await;
        seed_backup(&fx, "20240102T000000", "t", &[("p4_1_1_0", None)]).await;

        // Mark the old backup deleting (as an interrupted plan would have),
        // then create a new backup referencing one of its parts before the
        // purge runs.
        fx.catalog.mark_deleting("20240101T000000").await.unwrap();
        seed_backup(
            &fx,
            "20240103T000000",
            "t",
            &[("p1_1_1_0", Some("data/20240101T000000/t/p1_1_1_0.tar.gz"))],
        )
        .await;

        let policy = RetentionPolicy::from_options(Some(2), None, None).unwrap();
        let report = run_purge(&fx.catalog, &fx.driver, &fast_retry(), &policy)
            .await
            .unwrap();

        // the shared part survived, the rest of the entry was purged
        assert!(fx
            .driver
            .exists("data/20240101T000000/t/p1_1_1_0.tar.gz")
            .await
            .unwrap());
        assert!(!fx
            .driver
            .exists("data/20240101T000000/t/p2_1_1_0.tar.gz")
            .await
            .unwrap());
        assert_eq!(report.deleted_backups, vec!["20240101T000000"]);
        assert!(fx.catalog.try_get("20240101T000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn creating_entries_block_nothing_and_are_never_deleted() {
        let fx = fixture();
        seed_backup(&fx, "20240101T000000", "t", &[("p1_1_1_0", None)]).await;
        // an in-flight backup referencing the same key
        fx.catalog.create("20240102T000000").await.unwrap();
        fx.catalog
            .add_table_parts(
                "20240102T000000",
                TableEntry {
                    table: "t".into(),
                    schema: String::new(),
                    parts: vec![PartRef {
                        name: "p1_1_1_0".into(),
                        checksum: "sum-p1_1_1_0".into(),
                        size_bytes: 4,
                        paths: vec!["data/20240101T000000/t/p1_1_1_0.tar.gz".into()],
                        link: Some("20240101T000000".into()),
                    }],
                },
            )
            .await
            .unwrap();
        seed_backup(&fx, "20240103T000000", "t", &[("p9_1_1_0", None)]).await;

        let policy = RetentionPolicy::from_options(Some(1), None, None).unwrap();
        let report = run_purge(&fx.catalog, &fx.driver, &fast_retry(), &policy)
            .await
            .unwrap();

        // the creating entry's reference protected the blob
        assert!(fx
            .driver
            .exists("data/20240101T000000/t/p1_1_1_0.tar.gz")
            .await
            .unwrap());
        assert_eq!(report.deleted_backups, vec!["20240101T000000"]);
        // the creating entry itself is untouched
        assert!(fx.catalog.try_get("20240102T000000").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn referenced_parts_survive_random_create_purge_interleavings() {
        // Property: after every step, every storage key referenced by a
        // non-deleting catalog entry still exists in the store.
        let mut rng = StdRng::seed_from_u64(0x9a7c_2f11);
        for round in 0..8 {
            let fx = fixture();
            let policy = RetentionPolicy::from_options(Some(2), None, None).unwrap();
            let mut next_id = 0u32;

            for _step in 0..12 {
                if rng.gen_bool(0.6) {
                    // create a backup: fresh part plus, sometimes, a reuse of
                    // a random live part
                    let id = format!("2024010{}T{:06}", round + 1, next_id);
                    next_id += 1;
                    let entries = fx.catalog.list().await.unwrap();
                    let reusable: Vec<String> = entries
                        .iter()
                        .filter(|e| e.state.is_terminal())
                        .flat_map(|e| e.storage_keys().map(str::to_string))
                        .collect();
                    let mut parts: Vec<(String, Option<String>)> =
                        vec![(format!("p{next_id}_1_1_0"), None)];
                    if !reusable.is_empty() && rng.gen_bool(0.5) {
                        let pick = reusable[rng.gen_range(0..reusable.len())].clone();
                        parts.push((format!("q{next_id}_1_1_0"), Some(pick)));
                    }
                    let parts_ref: Vec<(&str, Option<&str>)> = parts
                        .iter()
                        .map(|(n, k)| (n.as_str(), k.as_deref()))
                        .collect();
                    seed_backup(&fx, &id, "t", &parts_ref).await;
                } else {
                    run_purge(&fx.catalog, &fx.driver, &fast_retry(), &policy)
                        .await
                        .unwrap();
                }

                // invariant: every key referenced by a live entry exists
                let entries = fx.catalog.list().await.unwrap();
                for entry in entries.iter().filter(|e| e.state != BackupState::Deleting) {
                    for key in entry.storage_keys() {
                        assert!(
                            fx.driver.exists(key).await.unwrap(),
                            "round {round}: live entry {} references deleted key {key}",
                            entry.id
                        );
                    }
                }
            }
        }
    }
}
