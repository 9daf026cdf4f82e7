//! Warehouse collaborator.
//!
//! The warehouse owns three of the provisioned resources: the dataset, the
//! connection granting it access to object storage, and the external table
//! registered over the Iceberg metadata.
//!
//! - [`BigQueryClient`]: BigQuery and BigQuery Connection REST APIs
//! - [`MemoryWarehouse`]: in-process, resolving external tables through storage

mod bigquery;
mod memory;

pub use bigquery::BigQueryClient;
pub use memory::{MemoryWarehouse, WarehouseOp};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::http::GoogleApiClient;
use crate::storage::ObjectStorage;
use crate::Result;

/// One result row, keyed by column name.
pub type QueryRow = Map<String, Value>;

/// Fully qualified dataset name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetRef {
    pub project: String,
    pub dataset: String,
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Fully qualified connection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub project: String,
    pub region: String,
    pub connection_id: String,
}

impl ConnectionRef {
    /// Parent resource: `projects/{p}/locations/{r}`.
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.region)
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/connections/{}", self.parent(), self.connection_id)
    }
}

/// Fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
        }
    }

    /// Backtick-quoted name for SQL.
    pub fn sql_name(&self) -> String {
        format!("`{}`", self)
    }

    /// Parse a backtick-quoted `project.dataset.table` name.
    pub fn parse_sql_name(name: &str) -> Option<Self> {
        let inner = name.trim().strip_prefix('`')?.strip_suffix('`')?;
        let mut parts = inner.splitn(3, '.');
        let project = parts.next()?.to_string();
        let dataset = parts.next()?.to_string();
        let table = parts.next()?.to_string();
        if project.is_empty() || dataset.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self {
            project,
            dataset,
            table,
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Source format of an external table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Iceberg,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Iceberg => "ICEBERG",
        }
    }
}

/// How an external table reads its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTableOptions {
    pub format: SourceFormat,
    /// Table location URI
    pub storage_uri: String,
    /// URI of the metadata document the table is registered at
    pub metadata_location: String,
    /// Connection the warehouse reads storage through
    pub connection: ConnectionRef,
}

/// Operations the core needs from the warehouse.
///
/// Drops of missing objects succeed.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool>;

    async fn create_dataset(&self, dataset: &DatasetRef, region: &str) -> Result<()>;

    async fn drop_dataset(&self, dataset: &DatasetRef) -> Result<()>;

    async fn connection_exists(&self, connection: &ConnectionRef) -> Result<bool>;

    async fn create_connection(&self, connection: &ConnectionRef) -> Result<()>;

    async fn drop_connection(&self, connection: &ConnectionRef) -> Result<()>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool>;

    /// Register an external table over storage.
    async fn create_external_table(
        &self,
        table: &TableRef,
        options: &ExternalTableOptions,
    ) -> Result<()>;

    async fn drop_table(&self, table: &TableRef) -> Result<()>;

    /// Run a SQL query and return its rows.
    async fn run_query(&self, sql: &str) -> Result<Vec<QueryRow>>;
}

/// Resource names derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseNames {
    pub dataset: DatasetRef,
    pub connection: ConnectionRef,
    pub table: TableRef,
}

impl WarehouseNames {
    pub fn from_config(config: &Config) -> Self {
        let project = config.gcp.project_id.clone();
        Self {
            dataset: DatasetRef {
                project: project.clone(),
                dataset: config.warehouse.dataset_id.clone(),
            },
            connection: ConnectionRef {
                project: project.clone(),
                region: config.gcp.region.clone(),
                connection_id: config.warehouse.connection_id.clone(),
            },
            table: TableRef {
                project,
                dataset: config.warehouse.dataset_id.clone(),
                table: config.warehouse.table_name.clone(),
            },
        }
    }
}

/// Build the warehouse selected by configuration.
///
/// Simulation runs use the in-memory warehouse over `storage`; everything
/// else talks to BigQuery.
pub fn from_config(
    config: &Config,
    api: Option<Arc<GoogleApiClient>>,
    storage: Arc<dyn ObjectStorage>,
    simulate: bool,
) -> Result<Arc<dyn Warehouse>> {
    if simulate {
        return Ok(Arc::new(MemoryWarehouse::new(storage)));
    }
    let api = api.ok_or_else(|| {
        crate::Error::Config("BigQuery requires Google API credentials".into())
    })?;
    Ok(Arc::new(BigQueryClient::new(
        api,
        config.gcp.project_id.clone(),
        config.warehouse.query_timeout_seconds,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef {
            project: "acme".into(),
            dataset: "lake".into(),
            table: "employees".into(),
        }
    }

    #[test]
    fn test_table_ref_sql_name() {
        let table = table();
        assert_eq!(table.sql_name(), "`acme.lake.employees`");
        assert_eq!(TableRef::parse_sql_name(&table.sql_name()), Some(table));
        assert_eq!(TableRef::parse_sql_name("acme.lake.employees"), None);
        assert_eq!(TableRef::parse_sql_name("`acme..employees`"), None);
    }

    #[test]
    fn test_connection_name() {
        let connection = ConnectionRef {
            project: "acme".into(),
            region: "us-central1".into(),
            connection_id: "biglake".into(),
        };
        assert_eq!(
            connection.to_string(),
            "projects/acme/locations/us-central1/connections/biglake"
        );
    }

    #[test]
    fn test_names_from_config() {
        let mut config = Config::default();
        config.gcp.project_id = "acme".into();
        config.gcp.region = "us-central1".into();
        config.warehouse.dataset_id = "lake".into();
        config.warehouse.table_name = "employees".into();
        config.warehouse.connection_id = "biglake".into();

        let names = WarehouseNames::from_config(&config);
        assert_eq!(names.table, table());
        assert_eq!(names.dataset.to_string(), "acme.lake");
        assert_eq!(names.connection.to_string(), config.connection_name());
    }
}
