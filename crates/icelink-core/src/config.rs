//! Configuration structures for icelink.
//!
//! Configuration is loaded from TOML files and can be overridden via
//! environment variables and CLI flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables that override file configuration.
pub mod env {
    pub const PROJECT_ID: &str = "GCP_PROJECT_ID";
    pub const REGION: &str = "GCP_REGION";
    pub const BUCKET_NAME: &str = "GCS_BUCKET_NAME";
    pub const DATASET_ID: &str = "BQ_DATASET_ID";
    pub const TABLE_NAME: &str = "BQ_TABLE_NAME";
    pub const CONNECTION_ID: &str = "BQ_CONNECTION_ID";
    pub const DATA_FILE: &str = "ICELINK_DATA_FILE";
    pub const ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Google Cloud project configuration
    #[serde(default)]
    pub gcp: GcpConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Warehouse (BigQuery) configuration
    #[serde(default)]
    pub warehouse: WarehouseConfig,

    /// Schema inference configuration
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Input data configuration
    #[serde(default)]
    pub data: DataConfig,

    /// API client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Google Cloud project configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GcpConfig {
    /// Project that owns every resource
    #[serde(default)]
    pub project_id: String,

    /// Region for the bucket, dataset and connection
    #[serde(default)]
    pub region: String,
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: StorageBackend,

    /// Bucket holding raw data and the Iceberg table (the storage location)
    #[serde(default)]
    pub bucket_name: String,

    /// Prefix under which Iceberg tables live
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Prefix for the raw JSON copy of the input
    #[serde(default = "default_raw_data_prefix")]
    pub raw_data_prefix: String,

    /// Upload the raw JSON input next to the table
    #[serde(default = "default_enabled")]
    pub upload_raw_copy: bool,

    /// Root directory for the local backend; buckets are subdirectories
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket_name: String::new(),
            table_prefix: default_table_prefix(),
            raw_data_prefix: default_raw_data_prefix(),
            upload_raw_copy: default_enabled(),
            local_root: default_local_root(),
        }
    }
}

/// Storage backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Google Cloud Storage (default)
    #[default]
    Gcs,
    /// Local filesystem
    Local,
    /// In-process memory, for library callers and tests
    Memory,
}

/// Warehouse configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarehouseConfig {
    /// Dataset containing the external table
    #[serde(default)]
    pub dataset_id: String,

    /// External table name
    #[serde(default)]
    pub table_name: String,

    /// Connection authorizing the warehouse to read the bucket
    #[serde(default)]
    pub connection_id: String,

    /// Query timeout in seconds
    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,

    /// Rows previewed by verify (0 disables the preview)
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dataset_id: String::new(),
            table_name: String::new(),
            connection_id: String::new(),
            query_timeout_seconds: default_query_timeout_seconds(),
            preview_rows: default_preview_rows(),
        }
    }
}

/// Schema inference configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaConfig {
    /// Records scanned for inference; all when unset
    #[serde(default)]
    pub sample_size: Option<usize>,

    /// How nested objects become columns
    #[serde(default)]
    pub nested_columns: NestedColumns,

    /// Separator used when flattening nested paths
    #[serde(default = "default_column_separator")]
    pub column_separator: String,

    /// Infer TIMESTAMP for RFC 3339 strings
    #[serde(default = "default_enabled")]
    pub detect_timestamps: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            sample_size: None,
            nested_columns: NestedColumns::default(),
            column_separator: default_column_separator(),
            detect_timestamps: default_enabled(),
        }
    }
}

/// Nested object handling.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NestedColumns {
    /// `address.city` becomes column `address_city` (default)
    #[default]
    Flatten,
    /// `address` stays a STRUCT column
    Struct,
}

/// Input data configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// JSON input: an array of objects or newline-delimited objects
    #[serde(default = "default_json_file_path")]
    pub json_file_path: PathBuf,

    /// Maximum rows per Parquet data file
    #[serde(default = "default_rows_per_file")]
    pub rows_per_file: usize,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            json_file_path: default_json_file_path(),
            rows_per_file: default_rows_per_file(),
            compression: ParquetCompression::default(),
        }
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default)
    #[default]
    Snappy,
    /// Zstd compression
    Zstd,
    /// LZ4 compression
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

impl ParquetCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParquetCompression::Snappy => "snappy",
            ParquetCompression::Zstd => "zstd",
            ParquetCompression::Lz4 => "lz4",
            ParquetCompression::Gzip => "gzip",
            ParquetCompression::None => "none",
        }
    }
}

/// Google API client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Static OAuth access token; the metadata server is used when unset
    #[serde(default)]
    pub access_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Maximum number of retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff between retries in milliseconds; the last value repeats
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: Vec<u64>,

    /// Consecutive failures before a service's circuit opens
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Seconds an open circuit waits before probing again
    #[serde(default = "default_circuit_reset_seconds")]
    pub circuit_reset_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_seconds: default_circuit_reset_seconds(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_table_prefix() -> String {
    "iceberg-tables".into()
}
fn default_raw_data_prefix() -> String {
    "raw-data".into()
}
fn default_local_root() -> PathBuf {
    PathBuf::from("./warehouse")
}
fn default_enabled() -> bool {
    true
}
fn default_query_timeout_seconds() -> u64 {
    60
}
fn default_preview_rows() -> usize {
    5
}
fn default_column_separator() -> String {
    "_".into()
}
fn default_json_file_path() -> PathBuf {
    PathBuf::from("sample_data.json")
}
fn default_rows_per_file() -> usize {
    100_000
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> Vec<u64> {
    vec![100, 500, 2000, 5000]
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_reset_seconds() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an optional file, apply process environment overrides and validate.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override values from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(env::PROJECT_ID) {
            self.gcp.project_id = v;
        }
        if let Some(v) = get(env::REGION) {
            self.gcp.region = v;
        }
        if let Some(v) = get(env::BUCKET_NAME) {
            self.storage.bucket_name = v;
        }
        if let Some(v) = get(env::DATASET_ID) {
            self.warehouse.dataset_id = v;
        }
        if let Some(v) = get(env::TABLE_NAME) {
            self.warehouse.table_name = v;
        }
        if let Some(v) = get(env::CONNECTION_ID) {
            self.warehouse.connection_id = v;
        }
        if let Some(v) = get(env::DATA_FILE) {
            self.data.json_file_path = PathBuf::from(v);
        }
        if let Some(v) = get(env::ACCESS_TOKEN) {
            self.client.access_token = Some(v);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let required = [
            ("gcp.project_id", env::PROJECT_ID, &self.gcp.project_id),
            ("gcp.region", env::REGION, &self.gcp.region),
            (
                "storage.bucket_name",
                env::BUCKET_NAME,
                &self.storage.bucket_name,
            ),
            (
                "warehouse.dataset_id",
                env::DATASET_ID,
                &self.warehouse.dataset_id,
            ),
            (
                "warehouse.table_name",
                env::TABLE_NAME,
                &self.warehouse.table_name,
            ),
            (
                "warehouse.connection_id",
                env::CONNECTION_ID,
                &self.warehouse.connection_id,
            ),
        ];

        for (field, var, value) in required {
            let value = value.trim();
            if value.is_empty() {
                return Err(crate::Error::Config(format!(
                    "{} is required (set it in the config file or {})",
                    field, var
                )));
            }
            if value.starts_with("your-") {
                return Err(crate::Error::Config(format!(
                    "{} still holds the placeholder '{}'",
                    field, value
                )));
            }
        }

        if self.storage.table_prefix.trim_matches('/').is_empty() {
            return Err(crate::Error::Config(
                "storage.table_prefix must not be empty".into(),
            ));
        }

        if self.schema.column_separator.is_empty()
            && self.schema.nested_columns == NestedColumns::Flatten
        {
            return Err(crate::Error::Config(
                "schema.column_separator must not be empty when flattening".into(),
            ));
        }

        if self.schema.sample_size == Some(0) {
            return Err(crate::Error::Config(
                "schema.sample_size must be at least 1".into(),
            ));
        }

        if self.storage.backend == StorageBackend::Memory {
            return Err(crate::Error::Config(
                "storage.backend \"memory\" holds objects only inside one process; \
                 use --simulate for an in-memory run"
                    .into(),
            ));
        }

        if self.data.rows_per_file == 0 {
            return Err(crate::Error::Config(
                "data.rows_per_file must be at least 1".into(),
            ));
        }

        if self.client.retry_backoff_ms.is_empty() && self.client.max_retries > 0 {
            tracing::warn!(
                max_retries = self.client.max_retries,
                "No retry backoff configured; retries will be immediate"
            );
        }

        Ok(())
    }

    /// Fully qualified connection name used by BigQuery.
    pub fn connection_name(&self) -> String {
        format!(
            "projects/{}/locations/{}/connections/{}",
            self.gcp.project_id, self.gcp.region, self.warehouse.connection_id
        )
    }
}
