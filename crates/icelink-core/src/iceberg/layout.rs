//! Object paths of an Iceberg table inside the bucket.
//!
//! ```text
//! {prefix}/{table}/data/part-00000-1a2b3c4d.parquet
//! {prefix}/{table}/metadata/v1.metadata.json
//! {prefix}/{table}/metadata/snap-1-manifest-list.json
//! {prefix}/{table}/metadata/snap-1-manifest.json
//! {prefix}/{table}/metadata/version-hint.text
//! ```

use crate::error::CommitError;
use crate::storage::ObjectStorage;
use crate::Result;

const VERSION_HINT: &str = "version-hint.text";

/// Paths of one table, relative to the bucket root, plus its location URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    root: String,
    location: String,
}

impl TableLayout {
    /// Layout for `table` under `prefix`.
    pub fn new(storage: &dyn ObjectStorage, prefix: &str, table: &str) -> Self {
        let root = format!("{}/{}", prefix.trim_matches('/'), table);
        let location = storage.uri(&root);
        Self { root, location }
    }

    /// Layout of an existing table from its location URI.
    pub fn from_location(storage: &dyn ObjectStorage, location: &str) -> Result<Self> {
        let bucket_uri = storage.uri("");
        let root = location
            .strip_prefix(bucket_uri.as_str())
            .map(|r| r.trim_matches('/'))
            .filter(|r| !r.is_empty())
            .ok_or_else(|| CommitError::OutsideLocation {
                path: location.to_string(),
                location: bucket_uri.clone(),
            })?;
        Ok(Self {
            root: root.to_string(),
            location: location.trim_end_matches('/').to_string(),
        })
    }

    /// Table root, relative to the bucket.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Table location URI.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn data_dir(&self) -> String {
        format!("{}/data", self.root)
    }

    pub fn metadata_dir(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn data_file(&self, name: &str) -> String {
        format!("{}/data/{}", self.root, name)
    }

    pub fn metadata_file(&self, version: u32) -> String {
        format!("{}/metadata/v{}.metadata.json", self.root, version)
    }

    pub fn manifest(&self, snapshot_id: i64) -> String {
        format!("{}/metadata/snap-{}-manifest.json", self.root, snapshot_id)
    }

    pub fn manifest_list(&self, snapshot_id: i64) -> String {
        format!(
            "{}/metadata/snap-{}-manifest-list.json",
            self.root, snapshot_id
        )
    }

    pub fn version_hint(&self) -> String {
        format!("{}/metadata/{}", self.root, VERSION_HINT)
    }

    /// URI of a path under the table root.
    pub fn uri(&self, path: &str) -> String {
        match path.strip_prefix(self.root.as_str()) {
            Some(rest) => format!("{}{}", self.location, rest),
            None => format!("{}/{}", self.location, path),
        }
    }

    /// Bucket-relative path of a URI under the table location.
    pub fn resolve(&self, uri: &str) -> Result<String> {
        match uri.strip_prefix(self.location.as_str()) {
            Some(rest) if rest.starts_with('/') => Ok(format!("{}{}", self.root, rest)),
            _ => Err(CommitError::OutsideLocation {
                path: uri.to_string(),
                location: self.location.clone(),
            }
            .into()),
        }
    }
}

/// Version number of a `v{N}.metadata.json` path.
pub fn parse_metadata_version(path: &str) -> Option<u32> {
    file_name(path)
        .strip_prefix('v')?
        .strip_suffix(".metadata.json")?
        .parse()
        .ok()
}

/// Snapshot id of a `snap-{id}-manifest.json` or `snap-{id}-manifest-list.json` path.
pub fn parse_snapshot_id(path: &str) -> Option<i64> {
    let rest = file_name(path).strip_prefix("snap-")?;
    let (id, _) = rest.split_once('-')?;
    id.parse().ok()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
