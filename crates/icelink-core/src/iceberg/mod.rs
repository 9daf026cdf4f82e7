//! Iceberg table construction.
//!
//! This module turns JSON records into a queryable Iceberg table:
//!
//! - Schema inference over heterogeneous JSON records
//! - JSON → Arrow → Parquet data files, content-addressed
//! - Iceberg v2 metadata, manifests and manifest lists as JSON documents
//! - Ordered commits behind a version hint, with snapshot chaining

mod builder;
mod layout;
mod manifest;
mod metadata;
mod schema;
mod schema_inference;
mod writer;

pub use builder::{CommittedTable, MetadataBuilder};
pub use layout::{parse_metadata_version, parse_snapshot_id, TableLayout};
pub use manifest::{
    ColumnStats, DataFile, EntryStatus, FileFormat, Manifest, ManifestEntry, ManifestFile,
    ManifestList,
};
pub use metadata::{
    IcebergSchema, IcebergType, ListType, MetadataLogEntry, NestedField, Operation, PartitionSpec,
    PrimitiveType, Snapshot, SnapshotLogEntry, SnapshotRef, SnapshotSummary, SortOrder,
    StructType, TableMetadata, FORMAT_VERSION,
};
pub use schema::{ColumnDescriptor, ColumnType, FieldPath, StructField, TableSchema};
pub use schema_inference::{InferenceOptions, SchemaInferencer};
pub use writer::{arrow_schema, parquet_row_count, read_rows, DataFileWriter, EncodedFile};
