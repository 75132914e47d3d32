pub(crate) mod archive;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::catalog::{BackupMeta, PartKey, PartRef};
use crate::errors::{Result, StorageError};
use crate::hash::hash_part_dir;
use crate::retry::{with_retry, RetryPolicy};
use crate::source::PartDescriptor;
use crate::storage::StorageDriver;

/// Default chunk limit for part tarballs: 256 MiB per storage object.
pub const DEFAULT_PART_CHUNK_BYTES: u64 = 256 * 1024 * 1024;

/// One prior backup's claim on a part identity, kept in the dedup index.
#[derive(Debug, Clone)]
struct DedupSource {
    /// Backup id that physically uploaded the bytes.
    origin: String,
    part: PartRef,
}

/// Identity-key index over prior backups, built once per backup run.
///
/// Only terminal entries (`created`, `partially_failed`) are valid dedup
/// sources — an in-progress backup's uploads may still fail, and a deleting
/// backup's blobs may be about to disappear. Entries older than the
/// configured age limit are ignored even when they match. Newer backups win
/// ties, and reuse always records the original uploader so link chains
/// never deepen.
pub struct DedupIndex {
    sources: HashMap<PartKey, DedupSource>,
}

impl DedupIndex {
    pub fn build(
        backups: &[BackupMeta],
        age_limit: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut sources: HashMap<PartKey, DedupSource> = HashMap::new();
        // Ascending id order: later inserts overwrite, so the newest valid
        // backup ends up as the source for each identity key.
        for backup in backups {
            if !backup.state.is_terminal() {
                continue;
            }
            if let Some(limit) = age_limit {
                if backup.start_time < now - limit {
                    continue;
                }
            }
            for table in &backup.tables {
                for part in &table.parts {
                    let origin = part.link.clone().unwrap_or_else(|| backup.id.clone());
                    sources.insert(
                        part.key(&table.table),
                        DedupSource {
                            origin,
                            part: part.clone(),
                        },
                    );
                }
            }
        }
        Self { sources }
    }

    fn lookup(&self, key: &PartKey) -> Option<&DedupSource> {
        self.sources.get(key)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Outcome of storing one part: the reference to record in the catalog plus
/// whether the bytes were reused from a prior backup.
#[derive(Debug, Clone)]
pub struct StoredPart {
    pub part_ref: PartRef,
    pub reused: bool,
    pub uploaded_bytes: u64,
}

/// Maps source parts to their remote blob representation and decides reuse
/// versus upload per part.
pub struct PartStore {
    driver: Arc<dyn StorageDriver>,
    retry: RetryPolicy,
    chunk_bytes: u64,
}

fn part_base_key(backup_id: &str, table: &str, part_name: &str) -> String {
    format!("data/{backup_id}/{table}/{part_name}.tar.gz")
}

impl PartStore {
    pub fn new(driver: Arc<dyn StorageDriver>, retry: RetryPolicy, chunk_bytes: u64) -> Self {
        Self {
            driver,
            retry,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Store one table's parts for a backup: dedup hits reuse the prior
    /// upload's storage keys, misses upload a freshly staged tarball. The
    /// returned refs are only handed back after every blob is durable, so an
    /// interruption mid-part leaves orphan objects at worst — never a
    /// catalog reference to missing bytes.
    pub async fn store_parts(
        &self,
        backup_id: &str,
        table: &str,
        parts: &[PartDescriptor],
        dedup: &DedupIndex,
    ) -> Result<Vec<StoredPart>> {
        let mut stored = Vec::with_capacity(parts.len());
        for part in parts {
            let key = PartKey {
                table: table.to_string(),
                name: part.name.clone(),
                checksum: part.checksum.clone(),
            };
            if let Some(source) = dedup.lookup(&key) {
                debug!(
                    "dedup hit: {table}/{} reused from backup {}",
                    part.name, source.origin
                );
                stored.push(StoredPart {
                    part_ref: PartRef {
                        name: part.name.clone(),
                        checksum: part.checksum.clone(),
                        size_bytes: part.size_bytes,
                        paths: source.part.paths.clone(),
                        link: Some(source.origin.clone()),
                    },
                    reused: true,
                    uploaded_bytes: 0,
                });
                continue;
            }

            let (paths, uploaded_bytes) = self.upload_part(backup_id, table, part).await?;
            debug!(
                "dedup miss: {table}/{} uploaded {uploaded_bytes} bytes in {} object(s)",
                part.name,
                paths.len()
            );
            stored.push(StoredPart {
                part_ref: PartRef {
                    name: part.name.clone(),
                    checksum: part.checksum.clone(),
                    size_bytes: part.size_bytes,
                    paths,
                    link: None,
                },
                reused: false,
                uploaded_bytes,
            });
        }
        Ok(stored)
    }

    /// Stage the part as a gzip tarball, then upload it as one object or as
    /// sequentially numbered chunk objects when it exceeds the chunk limit.
    async fn upload_part(
        &self,
        backup_id: &str,
        table: &str,
        part: &PartDescriptor,
    ) -> Result<(Vec<String>, u64)> {
        let staging = tempfile::tempdir()?;
        let tarball_path = staging.path().join("part.tar.gz");
        archive::create_part_tarball(&part.local_path, &tarball_path)?;

        let tarball_len = std::fs::metadata(&tarball_path)?.len();
        let base_key = part_base_key(backup_id, table, &part.name);

        let mut paths = Vec::new();
        let mut file = File::open(&tarball_path)?;

        if tarball_len <= self.chunk_bytes {
            let mut data = Vec::with_capacity(tarball_len as usize);
            file.read_to_end(&mut data)?;
            self.put_with_retry(&base_key, data).await?;
            paths.push(base_key);
        } else {
            let mut index = 0u32;
            loop {
                let mut chunk = vec![0u8; self.chunk_bytes as usize];
                let mut filled = 0;
                while filled < chunk.len() {
                    let n = file.read(&mut chunk[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    break;
                }
                chunk.truncate(filled);
                let key = format!("{base_key}.{index:03}");
                self.put_with_retry(&key, chunk).await?;
                paths.push(key);
                index += 1;
            }
        }

        Ok((paths, tarball_len))
    }

    async fn put_with_retry(&self, key: &str, data: Vec<u8>) -> Result<()> {
        with_retry(&self.retry, "part upload", || {
            let data = data.clone();
            self.driver.put(key, data)
        })
        .await?;
        Ok(())
    }

    /// Fetch referenced parts into `<dest_dir>/<part_name>/`, reassembling
    /// chunked tarballs in path order and re-verifying each part's checksum
    /// against the catalog record.
    pub async fn fetch_parts(
        &self,
        table: &str,
        refs: &[PartRef],
        dest_dir: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(dest_dir)?;
        for part_ref in refs {
            let staging = tempfile::tempdir()?;
            let tarball_path = staging.path().join("part.tar.gz");
            {
                let mut tarball = File::create(&tarball_path)?;
                for key in &part_ref.paths {
                    let data = with_retry(&self.retry, "part download", || {
                        self.driver.get(key)
                    })
                    .await?;
                    tarball.write_all(&data)?;
                }
                tarball.flush()?;
            }

            let part_dir = dest_dir.join(&part_ref.name);
            archive::extract_part_tarball(&tarball_path, &part_dir)?;

            let (checksum, _) = hash_part_dir(&part_dir)?;
            if checksum != part_ref.checksum {
                return Err(StorageError::Permanent(format!(
                    "checksum mismatch for {table}/{}: expected {}, got {checksum}",
                    part_ref.name, part_ref.checksum
                ))
                .into());
            }
            info!("restored part {table}/{}", part_ref.name);
        }
        Ok(())
    }
}
