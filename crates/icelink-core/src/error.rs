//! Error types for icelink core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use std::fmt;
use thiserror::Error;

use crate::provision::Resource;

/// Result type alias for icelink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for icelink.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, raised before any resource is touched
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema inference error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Metadata commit error
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// A resource could not be created or removed
    #[error("Provisioning of {resource} failed: {cause}")]
    Provisioning { resource: Resource, cause: String },

    /// Verification found a different row count than was written
    #[error("Row count mismatch: expected {expected}, warehouse reported {actual}")]
    Mismatch { expected: u64, actual: u64 },

    /// Verification could not run to completion
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Warehouse collaborator error
    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    /// Google API transport error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Parquet/Arrow encoding error
    #[error("Data file error: {0}")]
    DataFile(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Wrap any error as a provisioning failure of `resource`.
    pub fn provisioning(resource: Resource, cause: impl fmt::Display) -> Self {
        Error::Provisioning {
            resource,
            cause: cause.to_string(),
        }
    }
}

/// Schema inference errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Two incompatible kinds were observed at the same path
    #[error("Conflicting types at '{path}': {}", .types.join(" vs "))]
    Conflict { path: String, types: Vec<String> },

    /// Array elements at a path do not unify
    #[error("Heterogeneous array at '{path}': {}", .types.join(" vs "))]
    HeterogeneousArray { path: String, types: Vec<String> },

    /// Two source paths flatten to the same column name
    #[error("Column name '{name}' produced by both '{first}' and '{second}'")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    /// A top-level record is not a JSON object
    #[error("Record {index} is not a JSON object")]
    NotAnObject { index: usize },

    /// Nothing to infer from
    #[error("No records to infer a schema from")]
    Empty,

    /// The committed table schema differs from the inferred one
    #[error("Committed schema {schema_id} differs from the input data: {detail}")]
    Changed { schema_id: i32, detail: String },
}

/// Stage of the metadata commit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    Manifest,
    ManifestList,
    MetadataDocument,
    VersionHint,
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitStage::Manifest => "manifest",
            CommitStage::ManifestList => "manifest list",
            CommitStage::MetadataDocument => "metadata document",
            CommitStage::VersionHint => "version hint",
        };
        f.write_str(s)
    }
}

/// Metadata commit errors.
#[derive(Error, Debug)]
pub enum CommitError {
    /// The commit stopped part way; the current pointer did not advance
    #[error("Commit of snapshot {snapshot_id} interrupted writing the {stage}: {message}")]
    Partial {
        stage: CommitStage,
        snapshot_id: i64,
        /// Objects written before the failure; never referenced by a committed version
        orphaned: Vec<String>,
        message: String,
    },

    /// A committed document could not be read back
    #[error("Corrupt metadata at {path}: {message}")]
    Corrupt { path: String, message: String },

    /// A path does not live under the table location
    #[error("Path {path} is outside table location {location}")]
    OutsideLocation { path: String, location: String },
}

/// Object storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Bucket does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Bucket administration failed
    #[error("Bucket operation on {bucket} failed: {message}")]
    Bucket { bucket: String, message: String },

    /// Object operation failed
    #[error("{operation} {path} failed: {message}")]
    Object {
        operation: &'static str,
        path: String,
        message: String,
    },
}

/// Warehouse (BigQuery) errors.
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// API call returned an error status
    #[error("{operation} returned HTTP {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// Query did not finish within the configured timeout
    #[error("Query timed out after {0}s")]
    QueryTimeout(u64),

    /// Query text not understood (in-memory warehouse)
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    /// Named object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response body could not be interpreted
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Failure injected by the in-memory warehouse
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Google API transport errors.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Transport failure after retries
    #[error("Request failed: {0}")]
    Request(String),

    /// Access token could not be obtained
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Circuit breaker is open for the service
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::DataFile(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Error::DataFile(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Api(ApiError::Request(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("missing project".into());
        assert_eq!(err.to_string(), "Configuration error: missing project");

        let err = Error::provisioning(Resource::WarehouseDataset, "HTTP 403");
        assert_eq!(
            err.to_string(),
            "Provisioning of warehouse_dataset failed: HTTP 403"
        );
    }

    #[test]
    fn test_schema_conflict_names_path() {
        let err = SchemaError::Conflict {
            path: "x".into(),
            types: vec!["STRING".into(), "STRUCT".into()],
        };
        assert_eq!(err.to_string(), "Conflicting types at 'x': STRING vs STRUCT");

        let err: Error = err.into();
        assert!(matches!(err, Error::Schema(SchemaError::Conflict { .. })));
    }

    #[test]
    fn test_partial_commit_display() {
        let err = CommitError::Partial {
            stage: CommitStage::ManifestList,
            snapshot_id: 2,
            orphaned: vec!["metadata/snap-2-manifest.json".into()],
            message: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Commit of snapshot 2 interrupted writing the manifest list: connection reset"
        );
    }

    #[test]
    fn test_mismatch_error() {
        let err = Error::Mismatch {
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expected 2"));
    }
}
