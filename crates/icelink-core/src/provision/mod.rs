//! Resource provisioning.
//!
//! Four resources are managed, in this order:
//!
//! ```text
//! storage_location ──┐
//! warehouse_dataset ─┼──▶ external_table
//! connection ────────┘
//! ```
//!
//! The first three are independent of each other. Every step probes before
//! it acts, so re-running after any failure resumes where the last run
//! stopped and a fully provisioned setup makes no create calls.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::SchemaError;
use crate::iceberg::{
    CommittedTable, DataFileWriter, IcebergSchema, MetadataBuilder, SchemaInferencer, TableLayout,
    TableSchema,
};
use crate::storage::{normalize_prefix, ObjectStorage};
use crate::warehouse::{ExternalTableOptions, SourceFormat, Warehouse, WarehouseNames};
use crate::{Error, Result};

/// A provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    StorageLocation,
    WarehouseDataset,
    Connection,
    ExternalTable,
}

impl Resource {
    /// Creation order.
    pub const ALL: [Resource; 4] = [
        Resource::StorageLocation,
        Resource::WarehouseDataset,
        Resource::Connection,
        Resource::ExternalTable,
    ];

    /// Resources that must be present before this one can be created.
    pub fn depends_on(&self) -> &'static [Resource] {
        match self {
            Resource::ExternalTable => &[
                Resource::StorageLocation,
                Resource::WarehouseDataset,
                Resource::Connection,
            ],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::StorageLocation => "storage_location",
            Resource::WarehouseDataset => "warehouse_dataset",
            Resource::Connection => "connection",
            Resource::ExternalTable => "external_table",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceState {
    Absent,
    /// Creation started but did not finish
    Creating,
    Present,
    Failed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceState::Absent => "ABSENT",
            ResourceState::Creating => "CREATING",
            ResourceState::Present => "PRESENT",
            ResourceState::Failed => "FAILED",
        })
    }
}

/// What a probe found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceProbe {
    pub exists: bool,
    /// Traces of an interrupted creation
    pub partial: bool,
}

/// Map a probe to a state.
pub fn live_state(probe: ResourceProbe) -> ResourceState {
    match probe {
        ResourceProbe { exists: true, .. } => ResourceState::Present,
        ResourceProbe { partial: true, .. } => ResourceState::Creating,
        _ => ResourceState::Absent,
    }
}

/// What a run did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AlreadyPresent,
    Created,
    Deleted,
    AlreadyAbsent,
    /// A dependency failed
    Skipped,
    Failed,
    /// Read-only probe
    Probed,
}

/// Result of one resource step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceOutcome {
    pub resource: Resource,
    pub state: ResourceState,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceOutcome {
    fn new(resource: Resource, state: ResourceState, action: Action) -> Self {
        Self {
            resource,
            state,
            action,
            blocked_by: None,
            detail: None,
            error: None,
        }
    }

    fn failed(resource: Resource, error: &Error) -> Self {
        let mut outcome = Self::new(resource, ResourceState::Failed, Action::Failed);
        outcome.error = Some(error.to_string());
        outcome
    }

    fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    fn is_failed(&self) -> bool {
        matches!(self.action, Action::Failed | Action::Skipped)
    }
}

/// Outcomes of a run, one per resource in processing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvisionReport {
    pub outcomes: Vec<ResourceOutcome>,
}

impl ProvisionReport {
    pub fn outcome(&self, resource: Resource) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    pub fn state(&self, resource: Resource) -> Option<ResourceState> {
        self.outcome(resource).map(|o| o.state)
    }

    pub fn all_in(&self, state: ResourceState) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.state == state)
    }

    /// The first failed step as a provisioning error.
    pub fn first_failure(&self) -> Option<Error> {
        self.outcomes.iter().find(|o| o.is_failed()).map(|o| {
            let cause = match (&o.error, o.blocked_by) {
                (Some(error), _) => error.clone(),
                (None, Some(blocker)) => format!("blocked by failed {}", blocker),
                (None, None) => "not in the expected state".into(),
            };
            Error::provisioning(o.resource, cause)
        })
    }

    fn blocker(&self, resource: Resource) -> Option<Resource> {
        resource.depends_on().iter().copied().find(|dep| {
            self.outcome(*dep)
                .map(ResourceOutcome::is_failed)
                .unwrap_or(false)
        })
    }
}

/// Input of the external table step, after schema inference.
pub struct PreparedInput<'a> {
    pub dataset: &'a Dataset,
    pub schema: TableSchema,
}

/// Drives the resource chain against the storage and warehouse collaborators.
pub struct Provisioner {
    storage: Arc<dyn ObjectStorage>,
    warehouse: Arc<dyn Warehouse>,
    names: WarehouseNames,
    region: String,
    layout: TableLayout,
    raw_copy_path: Option<String>,
    inferencer: SchemaInferencer,
    writer: DataFileWriter,
    builder: MetadataBuilder,
}

impl Provisioner {
    pub fn new(config: &Config, storage: Arc<dyn ObjectStorage>, warehouse: Arc<dyn Warehouse>) -> Self {
        let names = WarehouseNames::from_config(config);
        let layout = TableLayout::new(
            storage.as_ref(),
            &config.storage.table_prefix,
            &names.table.table,
        );
        let raw_copy_path = config.storage.upload_raw_copy.then(|| {
            format!(
                "{}/{}.json",
                normalize_prefix(&config.storage.raw_data_prefix),
                names.table.table
            )
        });

        Self {
            writer: DataFileWriter::new(storage.clone(), &config.data),
            builder: MetadataBuilder::new(storage.clone()),
            inferencer: SchemaInferencer::new((&config.schema).into()),
            region: config.gcp.region.clone(),
            storage,
            warehouse,
            names,
            layout,
            raw_copy_path,
        }
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn names(&self) -> &WarehouseNames {
        &self.names
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn builder(&self) -> &MetadataBuilder {
        &self.builder
    }

    /// Infer the table schema. Nothing is written.
    pub fn prepare<'a>(&self, dataset: &'a Dataset) -> Result<PreparedInput<'a>> {
        let schema = self.inferencer.infer(&dataset.records)?;
        self.inferencer.check_records(&schema, &dataset.records)?;
        info!(
            source = %dataset.source,
            records = dataset.records.len(),
            columns = schema.columns.len(),
            "Inferred schema"
        );
        Ok(PreparedInput { dataset, schema })
    }

    /// Probe the live state of one resource.
    pub async fn probe(&self, resource: Resource) -> Result<ResourceProbe> {
        let exists = self.exists(resource).await?;
        let partial = !exists
            && resource == Resource::ExternalTable
            && self.builder.load_current(&self.layout).await?.is_some();

        Ok(ResourceProbe { exists, partial })
    }

    async fn exists(&self, resource: Resource) -> Result<bool> {
        match resource {
            Resource::StorageLocation => self.storage.bucket_exists().await,
            Resource::WarehouseDataset => self.warehouse.dataset_exists(&self.names.dataset).await,
            Resource::Connection => {
                self.warehouse
                    .connection_exists(&self.names.connection)
                    .await
            }
            Resource::ExternalTable => self.warehouse.table_exists(&self.names.table).await,
        }
    }

    /// Make `resource` present.
    ///
    /// Fails with [`Error::Provisioning`] naming the resource.
    pub async fn ensure(&self, resource: Resource, input: &PreparedInput<'_>) -> Result<ResourceOutcome> {
        self.try_ensure(resource, input)
            .await
            .map_err(|e| Error::provisioning(resource, e.to_string()))
    }

    async fn try_ensure(&self, resource: Resource, input: &PreparedInput<'_>) -> Result<ResourceOutcome> {
        let state = live_state(self.probe(resource).await?);
        if state == ResourceState::Present {
            debug!(%resource, "Already present");
            return Ok(ResourceOutcome::new(
                resource,
                ResourceState::Present,
                Action::AlreadyPresent,
            ));
        }

        info!(%resource, %state, "Creating resource");
        let detail = match resource {
            Resource::StorageLocation => {
                self.storage.create_bucket(&self.region).await?;
                None
            }
            Resource::WarehouseDataset => {
                self.warehouse
                    .create_dataset(&self.names.dataset, &self.region)
                    .await?;
                None
            }
            Resource::Connection => {
                self.warehouse
                    .create_connection(&self.names.connection)
                    .await?;
                None
            }
            Resource::ExternalTable => Some(self.create_external_table(input).await?),
        };

        info!(%resource, "Resource created");
        Ok(ResourceOutcome::new(resource, ResourceState::Present, Action::Created).with_detail(detail))
    }

    /// Create every resource, skipping dependants of failed ones.
    ///
    /// Schema inference runs first; a conflict aborts before anything is written.
    pub async fn ensure_all(&self, dataset: &Dataset) -> Result<ProvisionReport> {
        let input = self.prepare(dataset)?;
        let mut report = ProvisionReport::default();

        for resource in Resource::ALL {
            let outcome = match report.blocker(resource) {
                Some(blocker) => {
                    warn!(%resource, %blocker, "Skipping, dependency failed");
                    self.skipped(resource, blocker).await
                }
                None => match self.ensure(resource, &input).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(%resource, error = %e, "Provisioning failed");
                        ResourceOutcome::failed(resource, &e)
                    }
                },
            };
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    /// Read-only state of every resource.
    pub async fn status(&self) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        for resource in Resource::ALL {
            let outcome = match self.probe(resource).await {
                Ok(probe) => ResourceOutcome::new(resource, live_state(probe), Action::Probed),
                Err(e) => {
                    warn!(%resource, error = %e, "Probe failed");
                    ResourceOutcome::failed(resource, &e)
                }
            };
            report.outcomes.push(outcome);
        }
        report
    }

    /// Remove every resource, dependants first.
    ///
    /// Missing resources count as removed. A resource whose dependant could
    /// not be removed is left in place.
    pub async fn teardown(&self) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for resource in Resource::ALL.into_iter().rev() {
            let blocker = Resource::ALL
                .into_iter()
                .filter(|r| r.depends_on().contains(&resource))
                .find(|r| report.outcome(*r).map(ResourceOutcome::is_failed).unwrap_or(false));

            let outcome = match blocker {
                Some(blocker) => {
                    warn!(%resource, %blocker, "Keeping resource, dependant still present");
                    self.skipped(resource, blocker).await
                }
                None => match self.remove(resource).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(%resource, error = %e, "Teardown failed");
                        ResourceOutcome::failed(resource, &Error::provisioning(resource, e.to_string()))
                    }
                },
            };
            report.outcomes.push(outcome);
        }

        report
    }

    async fn remove(&self, resource: Resource) -> Result<ResourceOutcome> {
        if !self.exists(resource).await? {
            debug!(%resource, "Already absent");
            return Ok(ResourceOutcome::new(
                resource,
                ResourceState::Absent,
                Action::AlreadyAbsent,
            ));
        }

        let detail = match resource {
            Resource::ExternalTable => {
                self.warehouse.drop_table(&self.names.table).await?;
                None
            }
            Resource::Connection => {
                self.warehouse
                    .drop_connection(&self.names.connection)
                    .await?;
                None
            }
            Resource::WarehouseDataset => {
                self.warehouse.drop_dataset(&self.names.dataset).await?;
                None
            }
            Resource::StorageLocation => {
                let mut removed = self.storage.delete(self.layout.root()).await?;
                if let Some(raw) = &self.raw_copy_path {
                    removed += self.storage.delete(raw).await?;
                }
                // The bucket only goes away empty
                let foreign = self.storage.delete("").await?;
                if foreign > 0 {
                    warn!(
                        bucket = %self.storage.bucket(),
                        objects = foreign,
                        "Removed objects outside the table location"
                    );
                }
                removed += foreign;
                self.storage.delete_bucket().await?;
                Some(format!("{} objects removed", removed))
            }
        };

        info!(%resource, "Resource removed");
        Ok(ResourceOutcome::new(resource, ResourceState::Absent, Action::Deleted).with_detail(detail))
    }

    async fn skipped(&self, resource: Resource, blocker: Resource) -> ResourceOutcome {
        let state = match self.probe(resource).await {
            Ok(probe) => live_state(probe),
            Err(_) => ResourceState::Failed,
        };
        let mut outcome = ResourceOutcome::new(resource, state, Action::Skipped);
        outcome.blocked_by = Some(blocker);
        outcome
    }

    /// Write data and metadata if needed, then register the table.
    async fn create_external_table(&self, input: &PreparedInput<'_>) -> Result<String> {
        if let Some(path) = &self.raw_copy_path {
            let uri = self
                .storage
                .put(path, input.dataset.raw.clone())
                .await?;
            info!(%uri, "Uploaded raw copy");
        }

        let committed = self.commit_data(input).await?;
        let options = ExternalTableOptions {
            format: SourceFormat::Iceberg,
            storage_uri: self.layout.location().to_string(),
            metadata_location: committed.metadata_location.clone(),
            connection: self.names.connection.clone(),
        };
        self.warehouse
            .create_external_table(&self.names.table, &options)
            .await?;

        Ok(format!(
            "snapshot {} at v{}.metadata.json",
            committed
                .metadata
                .current_snapshot_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "none".into()),
            committed.version
        ))
    }

    /// Commit the dataset, reusing a commit that already holds exactly these files.
    async fn commit_data(&self, input: &PreparedInput<'_>) -> Result<CommittedTable> {
        let current = self.builder.load_current(&self.layout).await?;

        let iceberg: IcebergSchema = match &current {
            Some(current) => {
                let committed_schema = current.metadata.current_schema().ok_or_else(|| {
                    crate::error::CommitError::Corrupt {
                        path: current.metadata_path.clone(),
                        message: format!(
                            "current schema {} is missing",
                            current.metadata.current_schema_id
                        ),
                    }
                })?;
                if !input.schema.matches(committed_schema) {
                    return Err(SchemaError::Changed {
                        schema_id: committed_schema.schema_id,
                        detail: format!(
                            "inferred columns [{}] differ from the committed schema",
                            describe(&input.schema)
                        ),
                    }
                    .into());
                }
                committed_schema.clone()
            }
            None => {
                let mut last_column_id = 0;
                input.schema.to_iceberg(0, None, &mut last_column_id)
            }
        };

        let files = self
            .writer
            .encode(&input.dataset.records, &input.schema, &iceberg, &self.layout)?;

        match current {
            Some(current) => {
                let live = self.builder.live_data_files(&current.metadata).await?;
                if !files.is_empty() && files.iter().all(|f| live.contains(&f.data_file.file_path)) {
                    info!(
                        version = current.version,
                        snapshot_id = ?current.metadata.current_snapshot_id,
                        "Data already committed, reusing snapshot"
                    );
                    return Ok(current);
                }
                let data_files = self.writer.upload(&files).await?;
                self.builder
                    .append_snapshot(&current.metadata, &data_files, None)
                    .await
            }
            None => {
                let data_files = self.writer.upload(&files).await?;
                self.builder
                    .write_initial_snapshot(&input.schema, &data_files, &self.layout)
                    .await
            }
        }
    }
}

fn describe(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join(", ")
}
