//! BigQuery warehouse over the REST APIs.
//!
//! Datasets, tables and queries use BigQuery v2; connections use the
//! BigQuery Connection API v1. Transport concerns (auth, retry, circuit
//! breaking) live in [`GoogleApiClient`].

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{ConnectionRef, DatasetRef, ExternalTableOptions, QueryRow, TableRef, Warehouse};
use crate::error::WarehouseError;
use crate::http::{ApiResponse, GoogleApiClient, Service};
use crate::Result;

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";
const CONNECTION_API: &str = "https://bigqueryconnection.googleapis.com/v1";

/// Longest single wait for query results.
const MAX_POLL_MS: u64 = 10_000;

/// BigQuery client.
pub struct BigQueryClient {
    api: Arc<GoogleApiClient>,
    /// Project queries are billed to
    project: String,
    query_timeout: Duration,
}

impl BigQueryClient {
    pub fn new(api: Arc<GoogleApiClient>, project: impl Into<String>, query_timeout_seconds: u64) -> Self {
        Self {
            api,
            project: project.into(),
            query_timeout: Duration::from_secs(query_timeout_seconds),
        }
    }

    fn dataset_url(dataset: &DatasetRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            BIGQUERY_API,
            urlencoding::encode(&dataset.project),
            urlencoding::encode(&dataset.dataset)
        )
    }

    fn table_url(table: &TableRef) -> String {
        format!(
            "{}/tables/{}",
            Self::dataset_url(&table.dataset_ref()),
            urlencoding::encode(&table.table)
        )
    }

    async fn probe(&self, service: Service, url: &str, operation: &str) -> Result<bool> {
        let response = self.api.send(service, Method::GET, url, None).await?;
        match response.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(api_error(operation, &response)),
        }
    }

    async fn create(&self, service: Service, url: &str, body: &Value, operation: &str) -> Result<()> {
        let response = self.api.send(service, Method::POST, url, Some(body)).await?;
        match response.status {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!(operation, "Already exists");
                Ok(())
            }
            _ => Err(api_error(operation, &response)),
        }
    }

    async fn delete(&self, service: Service, url: &str, operation: &str) -> Result<()> {
        let response = self.api.send(service, Method::DELETE, url, None).await?;
        match response.status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(operation, "Already absent");
                Ok(())
            }
            _ => Err(api_error(operation, &response)),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool> {
        self.probe(Service::BigQuery, &Self::dataset_url(dataset), "datasets.get")
            .await
    }

    async fn create_dataset(&self, dataset: &DatasetRef, region: &str) -> Result<()> {
        let url = format!(
            "{}/projects/{}/datasets",
            BIGQUERY_API,
            urlencoding::encode(&dataset.project)
        );
        let body = json!({
            "datasetReference": {
                "projectId": dataset.project,
                "datasetId": dataset.dataset,
            },
            "location": region,
        });
        self.create(Service::BigQuery, &url, &body, "datasets.insert")
            .await?;
        info!(dataset = %dataset, region, "Created dataset");
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &DatasetRef) -> Result<()> {
        self.delete(Service::BigQuery, &Self::dataset_url(dataset), "datasets.delete")
            .await?;
        info!(dataset = %dataset, "Dropped dataset");
        Ok(())
    }

    async fn connection_exists(&self, connection: &ConnectionRef) -> Result<bool> {
        let url = format!("{}/{}", CONNECTION_API, connection);
        self.probe(Service::Connection, &url, "connections.get").await
    }

    async fn create_connection(&self, connection: &ConnectionRef) -> Result<()> {
        let url = format!(
            "{}/{}/connections?connectionId={}",
            CONNECTION_API,
            connection.parent(),
            urlencoding::encode(&connection.connection_id)
        );
        let body = json!({ "cloudResource": {} });
        self.create(Service::Connection, &url, &body, "connections.create")
            .await?;
        info!(connection = %connection, "Created connection");
        Ok(())
    }

    async fn drop_connection(&self, connection: &ConnectionRef) -> Result<()> {
        let url = format!("{}/{}", CONNECTION_API, connection);
        self.delete(Service::Connection, &url, "connections.delete")
            .await?;
        info!(connection = %connection, "Dropped connection");
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        self.probe(Service::BigQuery, &Self::table_url(table), "tables.get")
            .await
    }

    async fn create_external_table(
        &self,
        table: &TableRef,
        options: &ExternalTableOptions,
    ) -> Result<()> {
        let url = format!("{}/tables", Self::dataset_url(&table.dataset_ref()));
        let body = json!({
            "tableReference": {
                "projectId": table.project,
                "datasetId": table.dataset,
                "tableId": table.table,
            },
            "externalDataConfiguration": {
                "sourceFormat": options.format.as_str(),
                "sourceUris": [options.metadata_location],
                "connectionId": options.connection.to_string(),
            },
        });
        self.create(Service::BigQuery, &url, &body, "tables.insert")
            .await?;
        info!(
            table = %table,
            metadata_location = %options.metadata_location,
            "Created external table"
        );
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<()> {
        self.delete(Service::BigQuery, &Self::table_url(table), "tables.delete")
            .await?;
        info!(table = %table, "Dropped table");
        Ok(())
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        let deadline = Instant::now() + self.query_timeout;
        let project = urlencoding::encode(&self.project);
        let url = format!("{}/projects/{}/queries", BIGQUERY_API, project);
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": poll_ms(deadline),
        });

        debug!(sql, "Running query");
        let response = self
            .api
            .send(Service::BigQuery, Method::POST, &url, Some(&body))
            .await?;
        if !response.is_success() {
            return Err(api_error("jobs.query", &response));
        }
        let mut result: QueryResponse = response.json()?;

        while !result.job_complete {
            if Instant::now() >= deadline {
                warn!(sql, "Query timed out");
                return Err(WarehouseError::QueryTimeout(self.query_timeout.as_secs()).into());
            }
            let job = result.job_reference.as_ref().ok_or_else(|| {
                WarehouseError::UnexpectedResponse("incomplete query without job reference".into())
            })?;

            let mut url = format!(
                "{}/projects/{}/queries/{}?timeoutMs={}",
                BIGQUERY_API,
                project,
                urlencoding::encode(&job.job_id),
                poll_ms(deadline)
            );
            if let Some(location) = &job.location {
                url.push_str(&format!("&location={}", urlencoding::encode(location)));
            }

            let response = self
                .api
                .send(Service::BigQuery, Method::GET, &url, None)
                .await?;
            if !response.is_success() {
                return Err(api_error("jobs.getQueryResults", &response));
            }
            result = response.json()?;
        }

        if let Some(error) = result.errors.first() {
            return Err(WarehouseError::Api {
                operation: "jobs.query".into(),
                status: StatusCode::OK.as_u16(),
                message: error.message.clone(),
            }
            .into());
        }

        let rows = decode_rows(&result)?;
        debug!(rows = rows.len(), "Query finished");
        Ok(rows)
    }
}

fn api_error(operation: &str, response: &ApiResponse) -> crate::Error {
    WarehouseError::Api {
        operation: operation.to_string(),
        status: response.status.as_u16(),
        message: response.error_message(),
    }
    .into()
}

fn poll_ms(deadline: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (remaining.as_millis() as u64).clamp(1, MAX_POLL_MS)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<QuerySchema>,
    #[serde(default)]
    rows: Vec<RawRow>,
    #[serde(default)]
    errors: Vec<QueryErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryErrorProto {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    #[serde(default)]
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct QueryField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

/// Decode the `{"f": [{"v": ...}]}` row encoding using the result schema.
fn decode_rows(response: &QueryResponse) -> Result<Vec<QueryRow>> {
    let fields = response
        .schema
        .as_ref()
        .map(|s| s.fields.as_slice())
        .unwrap_or_default();
    response
        .rows
        .iter()
        .map(|row| decode_record(fields, &row.f))
        .collect()
}

fn decode_record(fields: &[QueryField], cells: &[Cell]) -> Result<QueryRow> {
    if fields.len() != cells.len() {
        return Err(WarehouseError::UnexpectedResponse(format!(
            "row has {} cells for {} fields",
            cells.len(),
            fields.len()
        ))
        .into());
    }
    fields
        .iter()
        .zip(cells)
        .map(|(field, cell)| Ok((field.name.clone(), decode_field(field, &cell.v)?)))
        .collect()
}

fn decode_field(field: &QueryField, value: &Value) -> Result<Value> {
    if field.mode.as_deref() == Some("REPEATED") {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        return items
            .iter()
            .map(|item| decode_scalar(field, item.get("v").unwrap_or(&Value::Null)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array);
    }
    decode_scalar(field, value)
}

fn decode_scalar(field: &QueryField, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let unexpected = || {
        crate::Error::from(WarehouseError::UnexpectedResponse(format!(
            "cannot decode {} value for '{}': {}",
            field.field_type, field.name, value
        )))
    };

    match field.field_type.as_str() {
        "RECORD" | "STRUCT" => {
            let cells: Vec<Cell> = value
                .get("f")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .ok_or_else(unexpected)?;
            Ok(Value::Object(decode_record(&field.fields, &cells)?))
        }
        "INTEGER" | "INT64" => value
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .ok_or_else(unexpected),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Value::from)
            .ok_or_else(unexpected),
        "BOOLEAN" | "BOOL" => match value.as_str() {
            Some("true") => Ok(Value::Bool(true)),
            Some("false") => Ok(Value::Bool(false)),
            _ => Err(unexpected()),
        },
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> QueryResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_decode_count_row() {
        let response = parse(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "row_count", "type": "INTEGER", "mode": "NULLABLE"}]},
            "rows": [{"f": [{"v": "2"}]}],
            "totalRows": "1"
        }));

        let rows = decode_rows(&response).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["row_count"], json!(2));
    }

    #[test]
    fn test_decode_mixed_types() {
        let response = parse(json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "name", "type": "STRING"},
                {"name": "age", "type": "INTEGER"},
                {"name": "score", "type": "FLOAT"},
                {"name": "active", "type": "BOOLEAN"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "address", "type": "RECORD", "fields": [
                    {"name": "city", "type": "STRING"},
                    {"name": "zip", "type": "INTEGER"}
                ]}
            ]},
            "rows": [{"f": [
                {"v": "A"},
                {"v": null},
                {"v": "5.5"},
                {"v": "true"},
                {"v": [{"v": "x"}, {"v": "y"}]},
                {"v": {"f": [{"v": "Oslo"}, {"v": "150"}]}}
            ]}]
        }));

        let rows = decode_rows(&response).unwrap();
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({
                "name": "A",
                "age": null,
                "score": 5.5,
                "active": true,
                "tags": ["x", "y"],
                "address": {"city": "Oslo", "zip": 150}
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_integer() {
        let response = parse(json!({
            "jobComplete": true,
            "schema": {"fields": [{"name": "n", "type": "INTEGER"}]},
            "rows": [{"f": [{"v": "two"}]}]
        }));
        assert!(decode_rows(&response).is_err());
    }

    #[test]
    fn test_incomplete_response_parses() {
        let response = parse(json!({
            "jobComplete": false,
            "jobReference": {"projectId": "acme", "jobId": "job_1", "location": "US"}
        }));
        assert!(!response.job_complete);
        assert_eq!(response.job_reference.unwrap().job_id, "job_1");
        assert!(response.rows.is_empty());
    }
}
