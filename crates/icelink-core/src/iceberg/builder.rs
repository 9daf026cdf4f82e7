//! Builds and commits Iceberg metadata.
//!
//! ## Commit Flow
//!
//! Every commit writes new objects bottom-up and never edits one in place:
//!
//! 1. `snap-{id}-manifest.json` listing the new data files
//! 2. `snap-{id}-manifest-list.json` referencing the new manifest plus every
//!    manifest of the parent snapshot
//! 3. `v{N}.metadata.json` with the new snapshot as current
//! 4. `version-hint.text` advanced to `N`
//!
//! The version hint is the only pointer readers follow. A failure at any step
//! leaves it on the previous version, so the previous metadata stays current;
//! the objects already written are orphans and the retry picks fresh ids.

use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::layout::{parse_metadata_version, parse_snapshot_id, TableLayout};
use super::manifest::{DataFile, Manifest, ManifestFile, ManifestList};
use super::metadata::{
    MetadataLogEntry, Operation, PartitionSpec, Snapshot, SnapshotLogEntry, SnapshotRef,
    SnapshotSummary, SortOrder, TableMetadata, FORMAT_VERSION, MAIN_BRANCH,
    UNPARTITIONED_LAST_PARTITION_ID,
};
use super::schema::TableSchema;
use crate::error::{CommitError, CommitStage, StorageError};
use crate::storage::ObjectStorage;
use crate::{Error, Result};

const INITIAL_SNAPSHOT_ID: i64 = 1;

/// A metadata document reachable through the version hint.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTable {
    pub version: u32,
    /// Bucket-relative path of the metadata document
    pub metadata_path: String,
    /// URI of the metadata document
    pub metadata_location: String,
    pub metadata: TableMetadata,
}

/// Constructs table metadata and commits it to storage.
pub struct MetadataBuilder {
    storage: Arc<dyn ObjectStorage>,
}

/// Snapshot being committed.
struct PendingCommit<'a> {
    layout: &'a TableLayout,
    snapshot_id: i64,
    sequence_number: i64,
    version: u32,
    manifest: Manifest,
    parent_manifests: Vec<ManifestFile>,
    parent_snapshot_id: Option<i64>,
}

impl MetadataBuilder {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Create the first snapshot of a table at `layout`.
    pub async fn write_initial_snapshot(
        &self,
        schema: &TableSchema,
        data_files: &[DataFile],
        layout: &TableLayout,
    ) -> Result<CommittedTable> {
        let existing = self.list_metadata(layout).await?;
        let snapshot_id = next_free_snapshot_id(&existing, INITIAL_SNAPSHOT_ID);
        let version = next_version(&existing);
        let now = now_ms(0);

        let mut last_column_id = 0;
        let iceberg_schema = schema.to_iceberg(0, None, &mut last_column_id);

        let sequence_number = 1;
        let manifest_list = layout.uri(&layout.manifest_list(snapshot_id));
        let snapshot = Snapshot {
            snapshot_id,
            parent_snapshot_id: None,
            sequence_number,
            timestamp_ms: now,
            manifest_list,
            summary: summary(data_files, None),
            schema_id: iceberg_schema.schema_id,
        };

        let metadata = TableMetadata {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location: layout.location().to_string(),
            last_sequence_number: sequence_number,
            last_updated_ms: now,
            last_column_id,
            current_schema_id: iceberg_schema.schema_id,
            schemas: vec![iceberg_schema],
            default_spec_id: 0,
            partition_specs: vec![PartitionSpec::unpartitioned()],
            last_partition_id: UNPARTITIONED_LAST_PARTITION_ID,
            default_sort_order_id: 0,
            sort_orders: vec![SortOrder::unsorted()],
            properties: default_properties(),
            current_snapshot_id: Some(snapshot_id),
            refs: BTreeMap::from([(MAIN_BRANCH.to_string(), SnapshotRef::branch(snapshot_id))]),
            snapshot_log: vec![SnapshotLogEntry {
                timestamp_ms: now,
                snapshot_id,
            }],
            snapshots: vec![snapshot],
            metadata_log: Vec::new(),
        };

        let pending = PendingCommit {
            layout,
            snapshot_id,
            sequence_number,
            version,
            manifest: Manifest::added(snapshot_id, sequence_number, 0, data_files),
            parent_manifests: Vec::new(),
            parent_snapshot_id: None,
        };

        let committed = self.commit(pending, metadata).await?;
        info!(
            location = %layout.location(),
            snapshot_id,
            version,
            files = data_files.len(),
            "Created table metadata"
        );
        Ok(committed)
    }

    /// Append a snapshot on top of `previous`.
    ///
    /// The current schema is kept unless `new_schema` differs from it, in
    /// which case it is added with the next schema id.
    pub async fn append_snapshot(
        &self,
        previous: &TableMetadata,
        new_data_files: &[DataFile],
        new_schema: Option<&TableSchema>,
    ) -> Result<CommittedTable> {
        let layout = TableLayout::from_location(self.storage.as_ref(), &previous.location)?;
        let existing = self.list_metadata(&layout).await?;

        let candidate = previous
            .current_snapshot_id
            .map(|id| id + 1)
            .unwrap_or(INITIAL_SNAPSHOT_ID);
        let snapshot_id = next_free_snapshot_id(&existing, candidate);
        if snapshot_id != candidate {
            warn!(
                candidate,
                snapshot_id, "Skipping snapshot ids left by an interrupted commit"
            );
        }
        let version = next_version(&existing);
        let now = now_ms(previous.last_updated_ms);
        let sequence_number = previous.last_sequence_number + 1;

        let mut metadata = previous.clone();
        if let Some(schema) = new_schema {
            self.evolve_schema(&mut metadata, schema);
        }

        let parent = previous.current_snapshot();
        let parent_manifests = match parent {
            Some(parent) => self.read_manifest_list(&layout, parent).await?.manifests,
            None => Vec::new(),
        };

        let snapshot = Snapshot {
            snapshot_id,
            parent_snapshot_id: previous.current_snapshot_id,
            sequence_number,
            timestamp_ms: now,
            manifest_list: layout.uri(&layout.manifest_list(snapshot_id)),
            summary: summary(new_data_files, parent),
            schema_id: metadata.current_schema_id,
        };

        if let Some(current) = self.read_version_hint(&layout).await? {
            metadata.metadata_log.push(MetadataLogEntry {
                timestamp_ms: previous.last_updated_ms,
                metadata_file: layout.uri(&layout.metadata_file(current)),
            });
        }
        metadata.last_sequence_number = sequence_number;
        metadata.last_updated_ms = now;
        metadata.current_snapshot_id = Some(snapshot_id);
        metadata
            .refs
            .insert(MAIN_BRANCH.to_string(), SnapshotRef::branch(snapshot_id));
        metadata.snapshot_log.push(SnapshotLogEntry {
            timestamp_ms: now,
            snapshot_id,
        });
        metadata.snapshots.push(snapshot);

        let pending = PendingCommit {
            layout: &layout,
            snapshot_id,
            sequence_number,
            version,
            manifest: Manifest::added(
                snapshot_id,
                sequence_number,
                metadata.current_schema_id,
                new_data_files,
            ),
            parent_manifests,
            parent_snapshot_id: previous.current_snapshot_id,
        };

        let committed = self.commit(pending, metadata).await?;
        info!(
            location = %layout.location(),
            snapshot_id,
            parent_snapshot_id = ?previous.current_snapshot_id,
            version,
            files = new_data_files.len(),
            "Appended snapshot"
        );
        Ok(committed)
    }

    /// The metadata the version hint points at, if any.
    pub async fn load_current(&self, layout: &TableLayout) -> Result<Option<CommittedTable>> {
        let Some(version) = self.read_version_hint(layout).await? else {
            return Ok(None);
        };

        let metadata_path = layout.metadata_file(version);
        let metadata: TableMetadata = self.read_json(&metadata_path).await?;
        debug!(version, snapshot_id = ?metadata.current_snapshot_id, "Loaded current metadata");

        Ok(Some(CommittedTable {
            version,
            metadata_location: layout.uri(&metadata_path),
            metadata_path,
            metadata,
        }))
    }

    /// Manifests reachable from the current snapshot.
    pub async fn current_manifests(&self, metadata: &TableMetadata) -> Result<Vec<Manifest>> {
        let Some(snapshot) = metadata.current_snapshot() else {
            return Ok(Vec::new());
        };
        let layout = TableLayout::from_location(self.storage.as_ref(), &metadata.location)?;
        let list = self.read_manifest_list(&layout, snapshot).await?;

        let mut manifests = Vec::with_capacity(list.manifests.len());
        for reference in &list.manifests {
            let path = layout.resolve(&reference.manifest_path)?;
            manifests.push(self.read_json(&path).await?);
        }
        Ok(manifests)
    }

    /// Records in the live data files of the current snapshot.
    pub async fn snapshot_record_count(&self, metadata: &TableMetadata) -> Result<u64> {
        Ok(self
            .current_manifests(metadata)
            .await?
            .iter()
            .map(Manifest::record_count)
            .sum())
    }

    /// URIs of the live data files of the current snapshot.
    pub async fn live_data_files(&self, metadata: &TableMetadata) -> Result<HashSet<String>> {
        Ok(self
            .current_manifests(metadata)
            .await?
            .iter()
            .flat_map(|m| m.live_entries().map(|e| e.data_file.file_path.clone()))
            .collect())
    }

    fn evolve_schema(&self, metadata: &mut TableMetadata, schema: &TableSchema) {
        let current = metadata.current_schema();
        if current.map(|c| schema.matches(c)).unwrap_or(false) {
            return;
        }

        let schema_id = metadata
            .schemas
            .iter()
            .map(|s| s.schema_id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(0);
        let mut last_column_id = metadata.last_column_id;
        let evolved = schema.to_iceberg(schema_id, current, &mut last_column_id);

        info!(
            schema_id,
            columns = evolved.fields.len(),
            "Adding schema version"
        );
        metadata.last_column_id = last_column_id.max(evolved.max_field_id());
        metadata.current_schema_id = schema_id;
        metadata.schemas.push(evolved);
    }

    async fn commit(&self, pending: PendingCommit<'_>, metadata: TableMetadata) -> Result<CommittedTable> {
        let layout = pending.layout;
        let snapshot_id = pending.snapshot_id;
        let mut orphaned = Vec::new();

        let manifest_path = layout.manifest(snapshot_id);
        let manifest_bytes = to_json_bytes(&pending.manifest)?;
        let manifest_length = manifest_bytes.len() as u64;
        self.put_stage(&manifest_path, manifest_bytes, CommitStage::Manifest, snapshot_id, &mut orphaned)
            .await?;

        let mut manifests = vec![ManifestFile::for_manifest(
            &pending.manifest,
            layout.uri(&manifest_path),
            manifest_length,
            pending.sequence_number,
        )];
        manifests.extend(pending.parent_manifests);
        let manifest_list = ManifestList {
            snapshot_id,
            parent_snapshot_id: pending.parent_snapshot_id,
            sequence_number: pending.sequence_number,
            manifests,
        };
        self.put_stage(
            &layout.manifest_list(snapshot_id),
            to_json_bytes(&manifest_list)?,
            CommitStage::ManifestList,
            snapshot_id,
            &mut orphaned,
        )
        .await?;

        let metadata_path = layout.metadata_file(pending.version);
        self.put_stage(
            &metadata_path,
            to_json_bytes(&metadata)?,
            CommitStage::MetadataDocument,
            snapshot_id,
            &mut orphaned,
        )
        .await?;

        self.put_stage(
            &layout.version_hint(),
            Bytes::from(pending.version.to_string()),
            CommitStage::VersionHint,
            snapshot_id,
            &mut orphaned,
        )
        .await?;

        Ok(CommittedTable {
            version: pending.version,
            metadata_location: layout.uri(&metadata_path),
            metadata_path,
            metadata,
        })
    }

    async fn put_stage(
        &self,
        path: &str,
        bytes: Bytes,
        stage: CommitStage,
        snapshot_id: i64,
        orphaned: &mut Vec<String>,
    ) -> Result<()> {
        match self.storage.put(path, bytes).await {
            Ok(_) => {
                debug!(path, %stage, "Wrote commit object");
                orphaned.push(path.to_string());
                Ok(())
            }
            Err(e) => {
                warn!(path, %stage, snapshot_id, error = %e, "Commit interrupted");
                Err(CommitError::Partial {
                    stage,
                    snapshot_id,
                    orphaned: std::mem::take(orphaned),
                    message: e.to_string(),
                }
                .into())
            }
        }
    }

    async fn read_version_hint(&self, layout: &TableLayout) -> Result<Option<u32>> {
        let path = layout.version_hint();
        let hint = match self.storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(Error::Storage(StorageError::NotFound(_)))
            | Err(Error::Storage(StorageError::BucketNotFound(_))) => return Ok(None),
            Err(e) => return Err(e),
        };

        std::str::from_utf8(&hint)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| {
                CommitError::Corrupt {
                    path,
                    message: "version hint is not a number".into(),
                }
                .into()
            })
    }

    async fn list_metadata(&self, layout: &TableLayout) -> Result<Vec<String>> {
        self.storage.list(&layout.metadata_dir()).await
    }

    async fn read_manifest_list(&self, layout: &TableLayout, snapshot: &Snapshot) -> Result<ManifestList> {
        let path = layout.resolve(&snapshot.manifest_list)?;
        self.read_json(&path).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = self.storage.get(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CommitError::Corrupt {
                path: path.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

fn next_free_snapshot_id(existing: &[String], candidate: i64) -> i64 {
    let taken: HashSet<i64> = existing.iter().filter_map(|p| parse_snapshot_id(p)).collect();
    let mut id = candidate;
    while taken.contains(&id) {
        id += 1;
    }
    id
}

fn next_version(existing: &[String]) -> u32 {
    existing
        .iter()
        .filter_map(|p| parse_metadata_version(p))
        .max()
        .unwrap_or(0)
        + 1
}

fn now_ms(not_before: i64) -> i64 {
    chrono::Utc::now().timestamp_millis().max(not_before)
}

fn default_properties() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("write.format.default".to_string(), "parquet".to_string()),
        ("created-by".to_string(), format!("icelink {}", env!("CARGO_PKG_VERSION"))),
    ])
}

fn summary(added: &[DataFile], parent: Option<&Snapshot>) -> SnapshotSummary {
    let added_files = added.len() as u64;
    let added_records: u64 = added.iter().map(|f| f.record_count).sum();
    let added_size: u64 = added.iter().map(|f| f.file_size_in_bytes).sum();

    let parent_total = |key: &str| -> u64 {
        parent
            .and_then(|p| p.summary.properties.get(key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    let properties = BTreeMap::from([
        ("added-data-files".to_string(), added_files.to_string()),
        ("added-records".to_string(), added_records.to_string()),
        ("added-files-size".to_string(), added_size.to_string()),
        (
            "total-data-files".to_string(),
            (parent_total("total-data-files") + added_files).to_string(),
        ),
        (
            "total-records".to_string(),
            (parent_total("total-records") + added_records).to_string(),
        ),
    ]);

    SnapshotSummary {
        operation: Operation::Append,
        properties,
    }
}

fn to_json_bytes<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec_pretty(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iceberg::manifest::FileFormat;
    use crate::iceberg::schema::{ColumnDescriptor, ColumnType, FieldPath};
    use crate::storage::MemoryStorage;

    fn schema() -> TableSchema {
        TableSchema::new(vec![ColumnDescriptor {
            name: "id".into(),
            data_type: ColumnType::Int64,
            nullable: false,
            source_path: FieldPath::root().child("id"),
        }])
    }

    fn data_file(layout: &TableLayout, name: &str, records: u64) -> DataFile {
        DataFile {
            file_path: layout.uri(&layout.data_file(name)),
            file_format: FileFormat::Parquet,
            record_count: records,
            file_size_in_bytes: 64,
            column_stats: BTreeMap::new(),
        }
    }

    fn setup() -> (MemoryStorage, MetadataBuilder, TableLayout) {
        let storage = MemoryStorage::with_bucket("lake");
        let builder = MetadataBuilder::new(Arc::new(storage.clone()));
        let layout = TableLayout::new(&storage, "iceberg-tables", "t");
        (storage, builder, layout)
    }

    #[tokio::test]
    async fn test_initial_snapshot_layout() {
        let (storage, builder, layout) = setup();
        let files = vec![data_file(&layout, "a.parquet", 2)];

        let committed = builder
            .write_initial_snapshot(&schema(), &files, &layout)
            .await
            .unwrap();

        let metadata = &committed.metadata;
        assert_eq!(committed.version, 1);
        assert_eq!(metadata.format_version, 2);
        assert_eq!(metadata.current_snapshot_id, Some(1));
        assert_eq!(metadata.current_schema_id, 0);
        assert_eq!(metadata.last_column_id, 1);
        let snapshot = metadata.current_snapshot().unwrap();
        assert_eq!(snapshot.parent_snapshot_id, None);
        assert_eq!(snapshot.operation(), Operation::Append);
        assert_eq!(snapshot.total_records(), Some(2));

        assert_eq!(
            storage.paths(),
            vec![
                "iceberg-tables/t/metadata/snap-1-manifest-list.json",
                "iceberg-tables/t/metadata/snap-1-manifest.json",
                "iceberg-tables/t/metadata/v1.metadata.json",
                "iceberg-tables/t/metadata/version-hint.text",
            ]
        );
        assert_eq!(
            committed.metadata_location,
            "memory://lake/iceberg-tables/t/metadata/v1.metadata.json"
        );

        let loaded = builder.load_current(&layout).await.unwrap().unwrap();
        assert_eq!(loaded, committed);
        assert_eq!(builder.snapshot_record_count(&loaded.metadata).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_commit_order() {
        let (storage, builder, layout) = setup();
        builder
            .write_initial_snapshot(&schema(), &[], &layout)
            .await
            .unwrap();

        let puts: Vec<String> = storage
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                crate::storage::StorageOp::Put { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(
            puts,
            vec![
                layout.manifest(1),
                layout.manifest_list(1),
                layout.metadata_file(1),
                layout.version_hint(),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_chain() {
        let (_, builder, layout) = setup();
        let v1 = builder
            .write_initial_snapshot(&schema(), &[data_file(&layout, "a.parquet", 1)], &layout)
            .await
            .unwrap();
        let v2 = builder
            .append_snapshot(&v1.metadata, &[data_file(&layout, "b.parquet", 2)], None)
            .await
            .unwrap();
        let v3 = builder
            .append_snapshot(&v2.metadata, &[data_file(&layout, "c.parquet", 3)], None)
            .await
            .unwrap();

        let metadata = &v3.metadata;
        assert_eq!(v3.version, 3);
        assert_eq!(metadata.current_snapshot_id, Some(3));
        assert_eq!(metadata.ancestry(), vec![3, 2, 1]);
        assert_eq!(metadata.snapshot(1).unwrap().parent_snapshot_id, None);
        assert_eq!(metadata.last_sequence_number, 3);
        assert_eq!(metadata.metadata_log.len(), 2);
        assert_eq!(
            metadata.metadata_log[1].metadata_file,
            layout.uri(&layout.metadata_file(2))
        );

        // Manifest lists are cumulative
        let manifests = builder.current_manifests(metadata).await.unwrap();
        assert_eq!(manifests.len(), 3);
        assert_eq!(builder.snapshot_record_count(metadata).await.unwrap(), 6);
        assert_eq!(metadata.current_snapshot().unwrap().total_records(), Some(6));

        // Previous documents are untouched
        let loaded = builder.load_current(&layout).await.unwrap().unwrap();
        assert_eq!(loaded.version, 3);
        let files = builder.live_data_files(metadata).await.unwrap();
        assert!(files.contains(&layout.uri(&layout.data_file("a.parquet"))));
    }

    #[tokio::test]
    async fn test_partial_commit_keeps_previous_current() {
        let (storage, builder, layout) = setup();
        let v1 = builder
            .write_initial_snapshot(&schema(), &[data_file(&layout, "a.parquet", 1)], &layout)
            .await
            .unwrap();

        storage.inject_failure(layout.manifest_list(2));
        let err = builder
            .append_snapshot(&v1.metadata, &[data_file(&layout, "b.parquet", 1)], None)
            .await
            .unwrap_err();

        match err {
            Error::Commit(CommitError::Partial {
                stage,
                snapshot_id,
                orphaned,
                ..
            }) => {
                assert_eq!(stage, CommitStage::ManifestList);
                assert_eq!(snapshot_id, 2);
                assert_eq!(orphaned, vec![layout.manifest(2)]);
            }
            other => panic!("expected partial commit, got {:?}", other),
        }

        let current = builder.load_current(&layout).await.unwrap().unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.metadata.current_snapshot_id, Some(1));

        // Retry uses a fresh snapshot id
        storage.clear_failures();
        let retried = builder
            .append_snapshot(&current.metadata, &[data_file(&layout, "b.parquet", 1)], None)
            .await
            .unwrap();
        assert_eq!(retried.metadata.current_snapshot_id, Some(3));
        assert_eq!(retried.metadata.ancestry(), vec![3, 1]);
        assert_eq!(retried.version, 2);
    }

    #[tokio::test]
    async fn test_failed_version_hint_keeps_previous_current() {
        let (storage, builder, layout) = setup();
        let v1 = builder
            .write_initial_snapshot(&schema(), &[], &layout)
            .await
            .unwrap();

        storage.inject_failure(layout.version_hint());
        let err = builder
            .append_snapshot(&v1.metadata, &[data_file(&layout, "b.parquet", 1)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Commit(CommitError::Partial {
                stage: CommitStage::VersionHint,
                ..
            })
        ));
        storage.clear_failures();

        let current = builder.load_current(&layout).await.unwrap().unwrap();
        assert_eq!(current.version, 1);

        let retried = builder
            .append_snapshot(&current.metadata, &[], None)
            .await
            .unwrap();
        assert_eq!(retried.version, 3);
        assert_eq!(retried.metadata.current_snapshot_id, Some(3));
    }

    #[tokio::test]
    async fn test_append_with_new_schema() {
        let (_, builder, layout) = setup();
        let v1 = builder
            .write_initial_snapshot(&schema(), &[], &layout)
            .await
            .unwrap();

        // Same schema keeps the id
        let same = builder
            .append_snapshot(&v1.metadata, &[], Some(&schema()))
            .await
            .unwrap();
        assert_eq!(same.metadata.schemas.len(), 1);

        let mut wider = schema();
        wider.columns.push(ColumnDescriptor {
            name: "score".into(),
            data_type: ColumnType::Float64,
            nullable: true,
            source_path: FieldPath::root().child("score"),
        });
        let evolved = builder
            .append_snapshot(&same.metadata, &[], Some(&wider))
            .await
            .unwrap();

        let metadata = &evolved.metadata;
        assert_eq!(metadata.schemas.len(), 2);
        assert_eq!(metadata.current_schema_id, 1);
        assert_eq!(metadata.last_column_id, 2);
        assert_eq!(metadata.current_snapshot().unwrap().schema_id, 1);
        assert_eq!(metadata.snapshot(1).unwrap().schema_id, 0);
    }

    #[tokio::test]
    async fn test_load_current_without_table() {
        let (_, builder, layout) = setup();
        assert!(builder.load_current(&layout).await.unwrap().is_none());

        let missing_bucket = MetadataBuilder::new(Arc::new(MemoryStorage::new("absent")));
        assert!(missing_bucket.load_current(&layout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_version_hint() {
        let (storage, builder, layout) = setup();
        storage
            .put(&layout.version_hint(), Bytes::from_static(b"not-a-number"))
            .await
            .unwrap();
        let err = builder.load_current(&layout).await.unwrap_err();
        assert!(matches!(err, Error::Commit(CommitError::Corrupt { .. })));
    }
}
