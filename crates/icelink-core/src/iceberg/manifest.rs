//! Manifest and manifest list documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileFormat {
    Parquet,
}

/// Per-column counters keyed by field id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ColumnStats {
    pub value_count: u64,
    pub null_count: u64,
}

/// An immutable data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataFile {
    /// Full URI of the file
    pub file_path: String,
    pub file_format: FileFormat,
    pub record_count: u64,
    pub file_size_in_bytes: u64,
    #[serde(default)]
    pub column_stats: BTreeMap<i32, ColumnStats>,
}

/// Status of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Existing,
    Added,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestEntry {
    pub status: EntryStatus,
    pub snapshot_id: i64,
    pub sequence_number: i64,
    pub data_file: DataFile,
}

/// Manifest document, written as `snap-{id}-manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    pub snapshot_id: i64,
    pub schema_id: i32,
    pub partition_spec_id: i32,
    pub content: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Manifest marking every file as added by `snapshot_id`.
    pub fn added(snapshot_id: i64, sequence_number: i64, schema_id: i32, files: &[DataFile]) -> Self {
        Self {
            snapshot_id,
            schema_id,
            partition_spec_id: 0,
            content: "data".into(),
            entries: files
                .iter()
                .map(|file| ManifestEntry {
                    status: EntryStatus::Added,
                    snapshot_id,
                    sequence_number,
                    data_file: file.clone(),
                })
                .collect(),
        }
    }

    /// Entries that are not deleted.
    pub fn live_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != EntryStatus::Deleted)
    }

    /// Sum of record counts over live entries.
    pub fn record_count(&self) -> u64 {
        self.live_entries().map(|e| e.data_file.record_count).sum()
    }
}

/// Reference from a manifest list to a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestFile {
    pub manifest_path: String,
    pub manifest_length: u64,
    pub partition_spec_id: i32,
    pub content: String,
    pub sequence_number: i64,
    pub min_sequence_number: i64,
    pub added_snapshot_id: i64,
    pub added_files_count: u32,
    pub existing_files_count: u32,
    pub deleted_files_count: u32,
    pub added_rows_count: u64,
    pub existing_rows_count: u64,
    pub deleted_rows_count: u64,
}

impl ManifestFile {
    /// Reference to a freshly written manifest.
    pub fn for_manifest(manifest: &Manifest, path: String, length: u64, sequence_number: i64) -> Self {
        let count = |status: EntryStatus| {
            manifest
                .entries
                .iter()
                .filter(|e| e.status == status)
                .fold((0u32, 0u64), |(files, rows), e| {
                    (files + 1, rows + e.data_file.record_count)
                })
        };
        let (added_files, added_rows) = count(EntryStatus::Added);
        let (existing_files, existing_rows) = count(EntryStatus::Existing);
        let (deleted_files, deleted_rows) = count(EntryStatus::Deleted);

        Self {
            manifest_path: path,
            manifest_length: length,
            partition_spec_id: manifest.partition_spec_id,
            content: manifest.content.clone(),
            sequence_number,
            min_sequence_number: manifest
                .entries
                .iter()
                .map(|e| e.sequence_number)
                .min()
                .unwrap_or(sequence_number),
            added_snapshot_id: manifest.snapshot_id,
            added_files_count: added_files,
            existing_files_count: existing_files,
            deleted_files_count: deleted_files,
            added_rows_count: added_rows,
            existing_rows_count: existing_rows,
            deleted_rows_count: deleted_rows,
        }
    }

    pub fn live_rows(&self) -> u64 {
        self.added_rows_count + self.existing_rows_count
    }

    pub fn live_files(&self) -> u64 {
        u64::from(self.added_files_count) + u64::from(self.existing_files_count)
    }
}

/// Manifest list document, written as `snap-{id}-manifest-list.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestList {
    pub snapshot_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub manifests: Vec<ManifestFile>,
}

impl ManifestList {
    pub fn total_rows(&self) -> u64 {
        self.manifests.iter().map(ManifestFile::live_rows).sum()
    }

    pub fn total_files(&self) -> u64 {
        self.manifests.iter().map(ManifestFile::live_files).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_file(name: &str, records: u64) -> DataFile {
        DataFile {
            file_path: format!("memory://b/t/data/{}", name),
            file_format: FileFormat::Parquet,
            record_count: records,
            file_size_in_bytes: 100,
            column_stats: [(1, ColumnStats { value_count: records, null_count: 0 })]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_manifest_entry_json() {
        let manifest = Manifest::added(1, 1, 0, &[data_file("a.parquet", 2)]);
        let value = serde_json::to_value(&manifest.entries[0]).unwrap();
        assert_eq!(value["status"], json!("ADDED"));
        assert_eq!(value["data-file"]["file-format"], json!("PARQUET"));
        assert_eq!(value["data-file"]["record-count"], json!(2));
        assert_eq!(
            value["data-file"]["column-stats"]["1"],
            json!({"value-count": 2, "null-count": 0})
        );

        let parsed: Manifest =
            serde_json::from_slice(&serde_json::to_vec(&manifest).unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_manifest_file_counts() {
        let mut manifest = Manifest::added(
            3,
            3,
            0,
            &[data_file("a.parquet", 2), data_file("b.parquet", 5)],
        );
        manifest.entries[1].status = EntryStatus::Deleted;

        let reference = ManifestFile::for_manifest(&manifest, "m.json".into(), 10, 3);
        assert_eq!(reference.added_files_count, 1);
        assert_eq!(reference.deleted_files_count, 1);
        assert_eq!(reference.added_rows_count, 2);
        assert_eq!(reference.deleted_rows_count, 5);
        assert_eq!(reference.live_rows(), 2);
        assert_eq!(manifest.record_count(), 2);
    }
}
