//! In-memory warehouse for simulation runs and tests.
//!
//! External tables are resolved the way the real warehouse does it: through
//! the metadata document they were registered at, read back from storage.
//! Two query shapes are understood:
//!
//! ```sql
//! SELECT COUNT(*) AS row_count FROM `project.dataset.table`
//! SELECT * FROM `project.dataset.table` LIMIT 5
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::{ConnectionRef, DatasetRef, ExternalTableOptions, QueryRow, TableRef, Warehouse};
use crate::error::WarehouseError;
use crate::iceberg::{parquet_row_count, read_rows, MetadataBuilder, TableLayout, TableMetadata};
use crate::storage::ObjectStorage;
use crate::{Error, Result};

/// Record of a warehouse call for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseOp {
    DatasetExists(String),
    CreateDataset(String),
    DropDataset(String),
    ConnectionExists(String),
    CreateConnection(String),
    DropConnection(String),
    TableExists(String),
    CreateExternalTable {
        table: String,
        metadata_location: String,
    },
    DropTable(String),
    Query(String),
}

impl WarehouseOp {
    /// Operation name, as used for failure injection.
    pub fn name(&self) -> &'static str {
        match self {
            WarehouseOp::DatasetExists(_) => "dataset_exists",
            WarehouseOp::CreateDataset(_) => "create_dataset",
            WarehouseOp::DropDataset(_) => "drop_dataset",
            WarehouseOp::ConnectionExists(_) => "connection_exists",
            WarehouseOp::CreateConnection(_) => "create_connection",
            WarehouseOp::DropConnection(_) => "drop_connection",
            WarehouseOp::TableExists(_) => "table_exists",
            WarehouseOp::CreateExternalTable { .. } => "create_external_table",
            WarehouseOp::DropTable(_) => "drop_table",
            WarehouseOp::Query(_) => "run_query",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            WarehouseOp::CreateDataset(_)
                | WarehouseOp::CreateConnection(_)
                | WarehouseOp::CreateExternalTable { .. }
        )
    }
}

#[derive(Default)]
struct State {
    datasets: BTreeSet<String>,
    connections: BTreeSet<String>,
    tables: BTreeMap<String, ExternalTableOptions>,
    operations: Vec<WarehouseOp>,
    failures: BTreeSet<&'static str>,
    row_count_override: Option<u64>,
}

/// In-memory warehouse. Clones share state.
#[derive(Clone)]
pub struct MemoryWarehouse {
    storage: Arc<dyn ObjectStorage>,
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// All recorded operations.
    pub fn operations(&self) -> Vec<WarehouseOp> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    /// Number of create calls recorded.
    pub fn create_calls(&self) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| op.is_create())
            .count()
    }

    /// Fail every call of the named operation (see [`WarehouseOp::name`]).
    pub fn inject_failure(&self, operation: &'static str) {
        self.state.lock().failures.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Report this count from `COUNT(*)` queries instead of the real one.
    pub fn override_row_count(&self, count: Option<u64>) {
        self.state.lock().row_count_override = count;
    }

    /// Registration of a table, if present.
    pub fn table(&self, table: &TableRef) -> Option<ExternalTableOptions> {
        self.state.lock().tables.get(&table.to_string()).cloned()
    }

    /// Record `op` and fail it if a failure was injected.
    fn record(&self, op: WarehouseOp) -> Result<()> {
        let mut state = self.state.lock();
        let name = op.name();
        state.operations.push(op);
        if state.failures.contains(name) {
            return Err(WarehouseError::Injected(name.to_string()).into());
        }
        Ok(())
    }

    async fn load_table_metadata(&self, table: &TableRef) -> Result<TableMetadata> {
        let options = self
            .table(table)
            .ok_or_else(|| WarehouseError::NotFound(format!("table {}", table)))?;

        let bucket_uri = self.storage.uri("");
        let path = options
            .metadata_location
            .strip_prefix(bucket_uri.as_str())
            .ok_or_else(|| {
                WarehouseError::UnexpectedResponse(format!(
                    "metadata location {} is outside {}",
                    options.metadata_location, bucket_uri
                ))
            })?;
        let bytes = self.storage.get(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn count_rows(&self, table: &TableRef) -> Result<u64> {
        let metadata = self.load_table_metadata(table).await?;
        if let Some(count) = self.state.lock().row_count_override {
            return Ok(count);
        }
        let layout = TableLayout::from_location(self.storage.as_ref(), &metadata.location)?;
        let manifests = MetadataBuilder::new(self.storage.clone())
            .current_manifests(&metadata)
            .await?;

        let mut rows = 0;
        for entry in manifests.iter().flat_map(|m| m.live_entries()) {
            let path = layout.resolve(&entry.data_file.file_path)?;
            rows += parquet_row_count(self.storage.get(&path).await?)?;
        }
        Ok(rows)
    }

    async fn scan_rows(&self, table: &TableRef, limit: usize) -> Result<Vec<QueryRow>> {
        let metadata = self.load_table_metadata(table).await?;
        let layout = TableLayout::from_location(self.storage.as_ref(), &metadata.location)?;
        let manifests = MetadataBuilder::new(self.storage.clone())
            .current_manifests(&metadata)
            .await?;

        let mut rows = Vec::new();
        for entry in manifests.iter().flat_map(|m| m.live_entries()) {
            if rows.len() >= limit {
                break;
            }
            let path = layout.resolve(&entry.data_file.file_path)?;
            let bytes = self.storage.get(&path).await?;
            rows.extend(read_rows(bytes, limit - rows.len())?);
        }
        Ok(rows)
    }
}

/// Query shapes the in-memory warehouse answers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParsedQuery {
    Count { alias: String, table: TableRef },
    Scan { table: TableRef, limit: Option<usize> },
}

fn parse_query(sql: &str) -> Option<ParsedQuery> {
    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    let from = upper.iter().position(|t| t == "FROM")?;
    if upper.first().map(String::as_str) != Some("SELECT") {
        return None;
    }
    let table = TableRef::parse_sql_name(tokens.get(from + 1)?)?;
    let tail = &upper[from + 2..];

    match &upper[1..from] {
        [star] if star == "*" => {
            let limit = match tail {
                [] => None,
                [limit, n] if limit == "LIMIT" => Some(n.parse().ok()?),
                _ => return None,
            };
            Some(ParsedQuery::Scan { table, limit })
        }
        [count, rest @ ..] if count == "COUNT(*)" && tail.is_empty() => {
            let alias = match rest {
                [] => "f0_".to_string(),
                [kw, _] if kw == "AS" => tokens[from - 1].to_string(),
                _ => return None,
            };
            Some(ParsedQuery::Count { alias, table })
        }
        _ => None,
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool> {
        let name = dataset.to_string();
        self.record(WarehouseOp::DatasetExists(name.clone()))?;
        Ok(self.state.lock().datasets.contains(&name))
    }

    async fn create_dataset(&self, dataset: &DatasetRef, region: &str) -> Result<()> {
        let name = dataset.to_string();
        self.record(WarehouseOp::CreateDataset(name.clone()))?;
        debug!(dataset = %name, region, "Created dataset");
        self.state.lock().datasets.insert(name);
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &DatasetRef) -> Result<()> {
        let name = dataset.to_string();
        self.record(WarehouseOp::DropDataset(name.clone()))?;
        let mut state = self.state.lock();
        let prefix = format!("{}.", name);
        if let Some(table) = state.tables.keys().find(|t| t.starts_with(&prefix)) {
            return Err(WarehouseError::Api {
                operation: "datasets.delete".into(),
                status: 400,
                message: format!("Dataset {} is still in use by table {}", name, table),
            }
            .into());
        }
        state.datasets.remove(&name);
        Ok(())
    }

    async fn connection_exists(&self, connection: &ConnectionRef) -> Result<bool> {
        let name = connection.to_string();
        self.record(WarehouseOp::ConnectionExists(name.clone()))?;
        Ok(self.state.lock().connections.contains(&name))
    }

    async fn create_connection(&self, connection: &ConnectionRef) -> Result<()> {
        let name = connection.to_string();
        self.record(WarehouseOp::CreateConnection(name.clone()))?;
        self.state.lock().connections.insert(name);
        Ok(())
    }

    async fn drop_connection(&self, connection: &ConnectionRef) -> Result<()> {
        let name = connection.to_string();
        self.record(WarehouseOp::DropConnection(name.clone()))?;
        self.state.lock().connections.remove(&name);
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        let name = table.to_string();
        self.record(WarehouseOp::TableExists(name.clone()))?;
        Ok(self.state.lock().tables.contains_key(&name))
    }

    async fn create_external_table(
        &self,
        table: &TableRef,
        options: &ExternalTableOptions,
    ) -> Result<()> {
        let name = table.to_string();
        self.record(WarehouseOp::CreateExternalTable {
            table: name.clone(),
            metadata_location: options.metadata_location.clone(),
        })?;

        let mut state = self.state.lock();
        if !state.datasets.contains(&table.dataset_ref().to_string()) {
            return Err(WarehouseError::NotFound(format!("dataset {}", table.dataset_ref())).into());
        }
        if !state.connections.contains(&options.connection.to_string()) {
            return Err(WarehouseError::NotFound(format!("connection {}", options.connection)).into());
        }
        state.tables.entry(name).or_insert_with(|| options.clone());
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<()> {
        let name = table.to_string();
        self.record(WarehouseOp::DropTable(name.clone()))?;
        self.state.lock().tables.remove(&name);
        Ok(())
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        self.record(WarehouseOp::Query(sql.to_string()))?;
        let query = parse_query(sql)
            .ok_or_else(|| Error::from(WarehouseError::UnsupportedQuery(sql.to_string())))?;
        debug!(?query, "Answering query");

        match query {
            ParsedQuery::Count { alias, table } => {
                let count = self.count_rows(&table).await?;
                let mut row = QueryRow::new();
                row.insert(alias, Value::from(count));
                Ok(vec![row])
            }
            ParsedQuery::Scan { table, limit } => {
                self.scan_rows(&table, limit.unwrap_or(usize::MAX)).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::warehouse::SourceFormat;

    fn names() -> (DatasetRef, ConnectionRef, TableRef) {
        let table = TableRef {
            project: "acme".into(),
            dataset: "lake".into(),
            table: "employees".into(),
        };
        let connection = ConnectionRef {
            project: "acme".into(),
            region: "us-central1".into(),
            connection_id: "biglake".into(),
        };
        (table.dataset_ref(), connection, table)
    }

    #[test]
    fn test_parse_query() {
        let (_, _, table) = names();
        assert_eq!(
            parse_query("SELECT COUNT(*) AS row_count FROM `acme.lake.employees`"),
            Some(ParsedQuery::Count {
                alias: "row_count".into(),
                table: table.clone()
            })
        );
        assert_eq!(
            parse_query("select *\n  from `acme.lake.employees`\n  limit 5"),
            Some(ParsedQuery::Scan {
                table: table.clone(),
                limit: Some(5)
            })
        );
        assert_eq!(
            parse_query("SELECT COUNT(*) FROM `acme.lake.employees`"),
            Some(ParsedQuery::Count {
                alias: "f0_".into(),
                table
            })
        );
        assert_eq!(parse_query("SELECT name FROM `acme.lake.employees`"), None);
        assert_eq!(parse_query("DELETE FROM `acme.lake.employees`"), None);
    }

    #[tokio::test]
    async fn test_table_requires_dataset_and_connection() {
        let warehouse = MemoryWarehouse::new(Arc::new(MemoryStorage::with_bucket("lake")));
        let (dataset, connection, table) = names();
        let options = ExternalTableOptions {
            format: SourceFormat::Iceberg,
            storage_uri: "memory://lake/iceberg-tables/employees".into(),
            metadata_location: "memory://lake/iceberg-tables/employees/metadata/v1.metadata.json"
                .into(),
            connection: connection.clone(),
        };

        assert!(warehouse.create_external_table(&table, &options).await.is_err());
        warehouse.create_dataset(&dataset, "us-central1").await.unwrap();
        warehouse.create_connection(&connection).await.unwrap();
        warehouse.create_external_table(&table, &options).await.unwrap();
        assert!(warehouse.table_exists(&table).await.unwrap());
        assert_eq!(warehouse.create_calls(), 4);

        // Dataset cannot be dropped while the table exists
        assert!(warehouse.drop_dataset(&dataset).await.is_err());
        warehouse.drop_table(&table).await.unwrap();
        warehouse.drop_dataset(&dataset).await.unwrap();
        assert!(!warehouse.dataset_exists(&dataset).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let warehouse = MemoryWarehouse::new(Arc::new(MemoryStorage::with_bucket("lake")));
        let (dataset, _, _) = names();
        warehouse.inject_failure("create_dataset");

        let err = warehouse
            .create_dataset(&dataset, "us-central1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Warehouse(WarehouseError::Injected(_))));
        assert!(!warehouse.dataset_exists(&dataset).await.unwrap());

        warehouse.clear_failures();
        warehouse.create_dataset(&dataset, "us-central1").await.unwrap();
        assert!(warehouse.dataset_exists(&dataset).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_query() {
        let warehouse = MemoryWarehouse::new(Arc::new(MemoryStorage::with_bucket("lake")));
        let err = warehouse.run_query("SELECT 1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Warehouse(WarehouseError::UnsupportedQuery(_))
        ));
    }
}
