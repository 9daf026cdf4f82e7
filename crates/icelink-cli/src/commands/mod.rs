//! Verb implementations.
//!
//! Each verb builds the collaborators from configuration, runs the
//! coordinator, prints the report and turns a non-successful outcome into
//! the matching core error.

use anyhow::Result;
use icelink_core::config::StorageBackend;
use icelink_core::http::GoogleApiClient;
use icelink_core::storage::{self, MemoryStorage, ObjectStorage};
use icelink_core::{warehouse, Config, Coordinator, Dataset, WorkflowReport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::report;
use crate::OutputFormat;

/// Flags shared by every verb.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub simulate: bool,
    pub format: OutputFormat,
}

/// Create every resource from the configured input data.
pub async fn setup(mut config: Config, data: Option<PathBuf>, options: RunOptions) -> Result<()> {
    if let Some(path) = data {
        config.data.json_file_path = path;
    }
    let dataset = Dataset::load(&config.data.json_file_path).await?;
    let coordinator = coordinator(&config, options)?;

    let report = coordinator.setup(&dataset).await?;
    finish(&report, options)
}

/// Show the state of every resource.
pub async fn status(config: Config, options: RunOptions) -> Result<()> {
    let coordinator = coordinator(&config, options)?;
    let report = coordinator.status().await;
    finish(&report, options)
}

/// Compare the warehouse row count with the committed data files.
pub async fn verify(config: Config, options: RunOptions) -> Result<()> {
    let coordinator = coordinator(&config, options)?;
    let report = coordinator.verify().await;
    finish(&report, options)
}

/// Remove every resource.
pub async fn cleanup(config: Config, options: RunOptions) -> Result<()> {
    let coordinator = coordinator(&config, options)?;
    let report = coordinator.cleanup().await;
    finish(&report, options)
}

fn finish(report: &WorkflowReport, options: RunOptions) -> Result<()> {
    report::print(report, options.format)?;
    report.ensure_success()?;
    Ok(())
}

/// Wire storage and warehouse for this run.
///
/// Simulation keeps a local storage backend when one is configured so the
/// written table can be inspected afterwards; anything else is held in memory
/// for the duration of the process.
fn coordinator(config: &Config, options: RunOptions) -> Result<Coordinator> {
    let (storage, api): (Arc<dyn ObjectStorage>, Option<Arc<GoogleApiClient>>) =
        if options.simulate {
            let storage = match config.storage.backend {
                StorageBackend::Local => storage::from_config(config, None)?,
                _ => Arc::new(MemoryStorage::new(config.storage.bucket_name.clone())),
            };
            (storage, None)
        } else {
            let api = Arc::new(GoogleApiClient::new(&config.client)?);
            (storage::from_config(config, Some(api.clone()))?, Some(api))
        };

    let warehouse = warehouse::from_config(config, api, storage.clone(), options.simulate)?;
    info!(
        bucket = %storage.bucket(),
        simulate = options.simulate,
        "Collaborators ready"
    );
    Ok(Coordinator::from_config(config, storage, warehouse))
}
