pub(crate) mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::Catalog;

/// Current catalog record format version. Readers tolerate records written
/// by newer versions carrying unknown fields.
pub const CATALOG_FORMAT_VERSION: u32 = 1;

/// Lifecycle state of a backup. Transitions are one-directional:
/// `creating → created | partially_failed → deleting → (record removed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Creating,
    Created,
    PartiallyFailed,
    Deleting,
}

impl BackupState {
    /// Terminal non-deleting states: the backup finished (fully or in part)
    /// and may be restored from, deduplicated against, and retained.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupState::Created | BackupState::PartiallyFailed)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupState::Creating => "creating",
            BackupState::Created => "created",
            BackupState::PartiallyFailed => "partially_failed",
            BackupState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// The dedup identity of a part: same table, same part name, same content
/// checksum means the same bytes, across any number of backups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartKey {
    pub table: String,
    pub name: String,
    pub checksum: String,
}

/// A backup's reference to one part's remote representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRef {
    pub name: String,
    pub checksum: String,
    pub size_bytes: u64,
    /// Storage keys holding the part's bytes. A part tarball larger than the
    /// chunk limit is split into sequentially numbered chunk objects.
    pub paths: Vec<String>,
    /// Id of the backup that physically uploaded the bytes; `None` when this
    /// backup uploaded them itself. Always points at the uploader directly,
    /// never at an intermediate reuser.
    #[serde(default)]
    pub link: Option<String>,
}

impl PartRef {
    pub fn key(&self, table: &str) -> PartKey {
        PartKey {
            table: table.to_string(),
            name: self.name.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

/// One table's slice of a backup: its schema text at snapshot time and the
/// parts it contained, in part-name order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub table: String,
    pub schema: String,
    pub parts: Vec<PartRef>,
}

/// A table that failed during backup creation, recorded so that a
/// partially-failed backup still reports exactly what is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTable {
    pub table: String,
    pub error: String,
}

/// The persisted record of one backup — a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    pub version: u32,
    pub id: String,
    pub state: BackupState,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
    #[serde(default)]
    pub failed_tables: Vec<FailedTable>,
}

impl BackupMeta {
    pub fn new(id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            version: CATALOG_FORMAT_VERSION,
            id: id.to_string(),
            state: BackupState::Creating,
            start_time,
            end_time: None,
            tables: Vec::new(),
            failed_tables: Vec::new(),
        }
    }

    pub fn find_table(&self, table: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|t| t.table == table)
    }

    /// Every storage key referenced by this backup's parts.
    pub fn storage_keys(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .flat_map(|t| t.parts.iter())
            .flat_map(|p| p.paths.iter())
            .map(|s| s.as_str())
    }

    pub fn part_count(&self) -> usize {
        self.tables.iter().map(|t| t.parts.len()).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.tables
            .iter()
            .flat_map(|t| t.parts.iter())
            .map(|p| p.size_bytes)
            .sum()
    }

    /// Bytes this backup reuses from earlier backups (dedup hits).
    pub fn reused_bytes(&self) -> u64 {
        self.tables
            .iter()
            .flat_map(|t| t.parts.iter())
            .filter(|p| p.link.is_some())
            .map(|p| p.size_bytes)
            .sum()
    }
}

/// Allocate a new backup identity from the wall clock. Lexicographic order
/// of ids equals chronological order, which `list` and retention rely on.
pub fn allocate_backup_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

/// Sort key parsed from a ClickHouse-style part name
/// `<partition>_<min_block>_<max_block>_<level>[_<mutation>]`. Names that do
/// not follow the scheme sort by partition id alone with zeroed blocks.
fn part_name_sort_key(name: &str) -> (String, i64, i64, i64, i64) {
    let chunks: Vec<&str> = name.splitn(5, '_').collect();
    let partition_id = chunks.first().unwrap_or(&"").to_string();
    let parse = |i: usize| chunks.get(i).and_then(|s| s.parse::<i64>().ok());
    match (parse(1), parse(2), parse(3)) {
        (Some(min_block), Some(max_block), Some(level)) => {
            let mutation = parse(4).unwrap_or(0);
            (partition_id, min_block, max_block, level, mutation)
        }
        _ => (partition_id, 0, 0, 0, 0),
    }
}

/// Order part references by parsed part name, the order the source database
/// itself uses for parts within a table.
pub fn sort_part_refs(parts: &mut [PartRef]) {
    parts.sort_by_key(|p| part_name_sort_key(&p.name));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str) -> PartRef {
        PartRef {
            name: name.to_string(),
            checksum: format!("sum-{name}"),
            size_bytes: 1,
            paths: vec![format!("data/b/t/{name}.tar.gz")],
            link: None,
        }
    }

    #[test]
    fn part_names_sort_by_parsed_components() {
        let mut parts = vec![
            part("202402_1_1_0"),
            part("202401_10_10_0"),
            part("202401_2_2_0"),
            part("202401_2_5_1"),
        ];
        sort_part_refs(&mut parts);
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["202401_2_2_0", "202401_2_5_1", "202401_10_10_0", "202402_1_1_0"]
        );
    }

    #[test]
    fn unparseable_part_names_fall_back_to_partition_order() {
        let mut parts = vec![part("zzz"), part("aaa"), part("202401_1_1_0")];
        sort_part_refs(&mut parts);
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["202401_1_1_0", "aaa", "zzz"]);
    }

    #[test]
    fn mutation_suffix_participates_in_ordering() {
        let key_plain = part_name_sort_key("202401_1_1_0");
        let key_mutated = part_name_sort_key("202401_1_1_0_7");
        assert!(key_plain < key_mutated);
    }

    #[test]
    fn backup_ids_order_chronologically() {
        let early = allocate_backup_id("2024-01-02T03:04:05Z".parse().unwrap());
        let late = allocate_backup_id("2024-01-02T03:04:06Z".parse().unwrap());
        assert_eq!(early, "20240102T030405");
        assert!(early < late);
    }

    #[test]
    fn unknown_fields_in_records_are_tolerated() {
        let json = r#"{
            "version": 2,
            "id": "20240101T000000",
            "state": "created",
            "start_time": "2024-01-01T00:00:00Z",
            "tables": [],
            "compression_codec": "zstd",
            "replica_set": ["a", "b"]
        }"#;
        let meta: BackupMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.id, "20240101T000000");
        assert_eq!(meta.state, BackupState::Created);
        assert!(meta.end_time.is_none());
        assert!(meta.failed_tables.is_empty());
    }

    #[test]
    fn byte_accounting_distinguishes_reused_parts() {
        let mut meta = BackupMeta::new("b1", Utc::now());
        let mut reused = part("202401_1_1_0");
        reused.link = Some("b0".into());
        reused.size_bytes = 10;
        let mut fresh = part("202401_2_2_0");
        fresh.size_bytes = 5;
        meta.tables.push(TableEntry {
            table: "events".into(),
            schema: String::new(),
            parts: vec![reused, fresh],
        });

        assert_eq!(meta.total_bytes(), 15);
        assert_eq!(meta.reused_bytes(), 10);
        assert_eq!(meta.part_count(), 2);
    }
}
