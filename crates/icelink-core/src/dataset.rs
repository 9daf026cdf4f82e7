//! Input records.
//!
//! A dataset is read either from a JSON array of objects or from
//! newline-delimited JSON. The raw bytes are kept for the raw copy uploaded
//! next to the table.

use bytes::Bytes;
use serde_json::Value;
use std::path::Path;
use tracing::info;

use crate::{Error, Result};

/// Records plus the bytes they were read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Where the records came from, for logging
    pub source: String,
    pub raw: Bytes,
    pub records: Vec<Value>,
}

impl Dataset {
    /// Read a dataset file.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            Error::Config(format!("Failed to read data file {}: {}", path.display(), e))
        })?;
        let dataset = Self::from_bytes(path.display().to_string(), Bytes::from(bytes))?;
        info!(
            source = %dataset.source,
            records = dataset.records.len(),
            bytes = dataset.raw.len(),
            "Loaded dataset"
        );
        Ok(dataset)
    }

    /// Parse a JSON array or newline-delimited JSON.
    pub fn from_bytes(source: impl Into<String>, raw: Bytes) -> Result<Self> {
        let source = source.into();
        let text = std::str::from_utf8(&raw)
            .map_err(|e| Error::Serialization(format!("{}: not UTF-8: {}", source, e)))?;

        let records = if text.trim_start().starts_with('[') {
            serde_json::from_str::<Vec<Value>>(text)
                .map_err(|e| Error::Serialization(format!("{}: {}", source, e)))?
        } else {
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(index, line)| {
                    serde_json::from_str(line).map_err(|e| {
                        Error::Serialization(format!("{}: line {}: {}", source, index + 1, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            source,
            raw,
            records,
        })
    }

    /// Dataset built in memory; the raw copy is the JSON array.
    pub fn from_records(records: Vec<Value>) -> Result<Self> {
        let raw = Bytes::from(serde_json::to_vec_pretty(&records)?);
        Ok(Self {
            source: "<memory>".into(),
            raw,
            records,
        })
    }
}
