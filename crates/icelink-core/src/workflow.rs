//! Workflow coordinator: the `setup`, `status`, `verify` and `cleanup` verbs.
//!
//! Each verb produces a [`WorkflowReport`] with one entry per resource, any
//! checks it ran, and an overall [`Outcome`].

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::Dataset;
use crate::iceberg::CommittedTable;
use crate::provision::{Provisioner, Resource, ResourceOutcome, ResourceState};
use crate::storage::ObjectStorage;
use crate::warehouse::{QueryRow, Warehouse};
use crate::{Error, Result};

/// Column alias of the verification count.
const ROW_COUNT_COLUMN: &str = "row_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Setup,
    Status,
    Verify,
    Cleanup,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Setup => "setup",
            Command::Status => "status",
            Command::Verify => "verify",
            Command::Cleanup => "cleanup",
        })
    }
}

/// Overall result of a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failed,
    Mismatch,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failed => "FAILED",
            Outcome::Mismatch => "MISMATCH",
        })
    }
}

/// A named verification step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }
}

/// Expected and reported row counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowCount {
    pub expected: u64,
    pub actual: u64,
}

/// Summary of the committed table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    pub location: String,
    pub metadata_location: String,
    pub metadata_version: u32,
    pub snapshot_id: Option<i64>,
    pub snapshot_count: usize,
    pub schema_id: i32,
    pub columns: Vec<String>,
    pub record_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub command: Command,
    pub outcome: Outcome,
    pub resources: Vec<ResourceOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<RowCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preview: Vec<QueryRow>,
}

impl WorkflowReport {
    fn new(command: Command, resources: Vec<ResourceOutcome>) -> Self {
        Self {
            command,
            outcome: Outcome::Success,
            resources,
            checks: Vec::new(),
            row_count: None,
            table: None,
            objects: Vec::new(),
            preview: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn resource(&self, resource: Resource) -> Option<&ResourceOutcome> {
        self.resources.iter().find(|o| o.resource == resource)
    }

    /// Turn a non-successful outcome into the error describing it.
    pub fn ensure_success(&self) -> Result<()> {
        match self.outcome {
            Outcome::Success => Ok(()),
            Outcome::Mismatch => {
                let count = self.row_count.unwrap_or(RowCount {
                    expected: 0,
                    actual: 0,
                });
                Err(Error::Mismatch {
                    expected: count.expected,
                    actual: count.actual,
                })
            }
            Outcome::Failed => {
                if let Some(check) = self.checks.iter().find(|c| !c.passed) {
                    return Err(Error::Verification(format!("{}: {}", check.name, check.detail)));
                }
                let expected = expected_state(self.command);
                let unfinished = self
                    .resources
                    .iter()
                    .filter(|o| o.state != expected)
                    .min_by_key(|o| o.error.is_none());
                Err(match unfinished {
                    Some(o) => {
                        let cause = match (&o.error, o.blocked_by) {
                            (Some(error), _) => error.clone(),
                            (None, Some(blocker)) => format!("blocked by failed {}", blocker),
                            (None, None) => format!("left {}", o.state),
                        };
                        Error::provisioning(o.resource, cause)
                    }
                    None => Error::Verification(format!("{} did not succeed", self.command)),
                })
            }
        }
    }
}

/// State every resource should be in after a successful run of `command`.
fn expected_state(command: Command) -> ResourceState {
    match command {
        Command::Cleanup => ResourceState::Absent,
        _ => ResourceState::Present,
    }
}

/// Runs the verbs over a [`Provisioner`].
pub struct Coordinator {
    provisioner: Provisioner,
    preview_rows: usize,
}

impl Coordinator {
    pub fn new(provisioner: Provisioner, preview_rows: usize) -> Self {
        Self {
            provisioner,
            preview_rows,
        }
    }

    /// Coordinator over the given collaborators.
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn ObjectStorage>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self::new(
            Provisioner::new(config, storage, warehouse),
            config.warehouse.preview_rows,
        )
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Create every resource. SUCCESS only when all of them are present.
    ///
    /// A schema conflict in the input is returned as an error; nothing has
    /// been written at that point.
    pub async fn setup(&self, dataset: &Dataset) -> Result<WorkflowReport> {
        info!(source = %dataset.source, "Running setup");
        let provisioned = self.provisioner.ensure_all(dataset).await?;

        let mut report = WorkflowReport::new(Command::Setup, provisioned.outcomes.clone());
        if !provisioned.all_in(ResourceState::Present) {
            report.outcome = Outcome::Failed;
        }
        report.table = self.table_summary().await;

        info!(outcome = %report.outcome, "Setup finished");
        Ok(report)
    }

    /// Read-only inventory. Always SUCCESS.
    pub async fn status(&self) -> WorkflowReport {
        let provisioned = self.provisioner.status().await;
        let storage_present =
            provisioned.state(Resource::StorageLocation) == Some(ResourceState::Present);

        let mut report = WorkflowReport::new(Command::Status, provisioned.outcomes);
        if storage_present {
            let root = self.provisioner.layout().root();
            match self.provisioner.storage().list(root).await {
                Ok(objects) => report.objects = objects,
                Err(e) => warn!(error = %e, "Failed to list table objects"),
            }
            report.table = self.table_summary().await;
        }
        report
    }

    /// Compare the warehouse's row count with the committed data files.
    pub async fn verify(&self) -> WorkflowReport {
        let provisioned = self.provisioner.status().await;
        let table_state = provisioned.state(Resource::ExternalTable);
        let mut report = WorkflowReport::new(Command::Verify, provisioned.outcomes);

        if table_state != Some(ResourceState::Present) {
            let state = table_state.unwrap_or(ResourceState::Failed);
            report
                .checks
                .push(Check::new("external_table", false, format!("table is {}", state)));
            report.outcome = Outcome::Failed;
            return report;
        }
        report
            .checks
            .push(Check::new("external_table", true, "table is PRESENT"));

        let current = match self.load_current().await {
            Ok(Some(current)) => current,
            Ok(None) => {
                report
                    .checks
                    .push(Check::new("metadata", false, "no committed metadata"));
                report.outcome = Outcome::Failed;
                return report;
            }
            Err(e) => {
                report.checks.push(Check::new("metadata", false, e.to_string()));
                report.outcome = Outcome::Failed;
                return report;
            }
        };

        let expected = match self
            .provisioner
            .builder()
            .snapshot_record_count(&current.metadata)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                report.checks.push(Check::new("metadata", false, e.to_string()));
                report.outcome = Outcome::Failed;
                return report;
            }
        };
        report.table = Some(self.summarize(&current, expected));

        let actual = match self.query_row_count().await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(error = %e, "Row count query failed");
                report.checks.push(Check::new("row_count", false, e.to_string()));
                report.outcome = Outcome::Failed;
                return report;
            }
        };

        report.row_count = Some(RowCount { expected, actual });
        if actual == expected {
            info!(expected, actual, "Row count verified");
            report.checks.push(Check::new(
                "row_count",
                true,
                format!("{} = {}", actual, expected),
            ));
        } else {
            warn!(expected, actual, "Row count mismatch");
            report.checks.push(Check::new(
                "row_count",
                false,
                format!("warehouse reports {}, committed data files hold {}", actual, expected),
            ));
            report.outcome = Outcome::Mismatch;
            return report;
        }

        if self.preview_rows > 0 {
            let sql = format!(
                "SELECT * FROM {} LIMIT {}",
                self.provisioner.names().table.sql_name(),
                self.preview_rows
            );
            match self.provisioner.warehouse().run_query(&sql).await {
                Ok(rows) => report.preview = rows,
                Err(e) => warn!(error = %e, "Preview query failed"),
            }
        }

        report
    }

    /// Remove every resource. Idempotent; SUCCESS when everything is absent.
    pub async fn cleanup(&self) -> WorkflowReport {
        info!("Running cleanup");
        let provisioned = self.provisioner.teardown().await;

        let mut report = WorkflowReport::new(Command::Cleanup, provisioned.outcomes.clone());
        if !provisioned.all_in(ResourceState::Absent) {
            report.outcome = Outcome::Failed;
        }

        info!(outcome = %report.outcome, "Cleanup finished");
        report
    }

    async fn load_current(&self) -> Result<Option<CommittedTable>> {
        self.provisioner
            .builder()
            .load_current(self.provisioner.layout())
            .await
    }

    async fn table_summary(&self) -> Option<TableSummary> {
        let current = match self.load_current().await {
            Ok(current) => current?,
            Err(e) => {
                warn!(error = %e, "Failed to load table metadata");
                return None;
            }
        };
        let record_count = match self
            .provisioner
            .builder()
            .snapshot_record_count(&current.metadata)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count committed records");
                return None;
            }
        };
        Some(self.summarize(&current, record_count))
    }

    fn summarize(&self, current: &CommittedTable, record_count: u64) -> TableSummary {
        let metadata = &current.metadata;
        TableSummary {
            location: metadata.location.clone(),
            metadata_location: current.metadata_location.clone(),
            metadata_version: current.version,
            snapshot_id: metadata.current_snapshot_id,
            snapshot_count: metadata.snapshots.len(),
            schema_id: metadata.current_schema_id,
            columns: metadata
                .current_schema()
                .map(|s| s.fields.iter().map(|f| f.name.clone()).collect())
                .unwrap_or_default(),
            record_count,
        }
    }

    async fn query_row_count(&self) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS {} FROM {}",
            ROW_COUNT_COLUMN,
            self.provisioner.names().table.sql_name()
        );
        let rows = self.provisioner.warehouse().run_query(&sql).await?;
        rows.first()
            .and_then(|row| row.get(ROW_COUNT_COLUMN))
            .and_then(count_value)
            .ok_or_else(|| Error::Verification(format!("no {} in query result", ROW_COUNT_COLUMN)))
    }
}

/// Counts arrive as numbers or as decimal strings.
fn count_value(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
