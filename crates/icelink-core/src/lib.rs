//! icelink core - Iceberg tables on object storage, registered in BigQuery
//!
//! This library turns a batch of JSON records into an Iceberg table and
//! makes it queryable as a BigLake external table:
//!
//! - Schema inference over arbitrarily nested JSON
//! - Parquet data files plus Iceberg v2 metadata, committed bottom-up
//! - Idempotent provisioning of bucket, dataset, connection and table
//! - Verification of the warehouse's row count against the committed files
//! - Safe teardown in reverse dependency order

pub mod circuit_breaker;
pub mod config;
pub mod dataset;
pub mod error;
pub mod http;
pub mod iceberg;
pub mod provision;
pub mod storage;
pub mod warehouse;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use dataset::Dataset;
pub use error::{CommitError, SchemaError, StorageError, WarehouseError};
pub use error::{Error, Result};
pub use provision::{Provisioner, Resource, ResourceState};
pub use workflow::{Coordinator, Outcome, WorkflowReport};
