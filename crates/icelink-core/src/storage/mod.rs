//! Object storage collaborator.
//!
//! The storage location resource is a bucket; everything the core writes
//! (raw JSON copy, Parquet data files, Iceberg documents) is an object in it
//! addressed by a slash-separated path relative to the bucket root.
//!
//! - [`GcsStorage`]: Google Cloud Storage
//! - [`LocalStorage`]: a directory per bucket on the local filesystem
//! - [`MemoryStorage`]: in-process, with operation tracing and failure injection

mod gcs;
mod local;
mod memory;

pub use gcs::GcsStorage;
pub use local::LocalStorage;
pub use memory::{MemoryStorage, StorageOp};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

use crate::config::{Config, StorageBackend};
use crate::error::StorageError;
use crate::http::GoogleApiClient;
use crate::Result;

/// Operations the core needs from object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Bucket backing this storage.
    fn bucket(&self) -> &str;

    /// URI of an object path, as stored in Iceberg documents.
    fn uri(&self, path: &str) -> String;

    /// Check whether the bucket exists.
    async fn bucket_exists(&self) -> Result<bool>;

    /// Create the bucket in `region`.
    async fn create_bucket(&self, region: &str) -> Result<()>;

    /// Delete the (empty) bucket.
    async fn delete_bucket(&self) -> Result<()>;

    /// Write an object, replacing any previous content. Returns its URI.
    async fn put(&self, path: &str, bytes: Bytes) -> Result<String>;

    /// Read an object.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Check whether an object exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List object paths under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every object under a prefix. Returns the number removed.
    async fn delete(&self, prefix: &str) -> Result<usize>;
}

/// Build the storage backend selected by configuration.
pub fn from_config(config: &Config, api: Option<Arc<GoogleApiClient>>) -> Result<Arc<dyn ObjectStorage>> {
    let bucket = config.storage.bucket_name.clone();
    let storage: Arc<dyn ObjectStorage> = match config.storage.backend {
        StorageBackend::Gcs => {
            let api = api.ok_or_else(|| {
                crate::Error::Config("GCS storage requires Google API credentials".into())
            })?;
            Arc::new(GcsStorage::new(bucket, &config.gcp.project_id, api)?)
        }
        StorageBackend::Local => Arc::new(LocalStorage::new(&config.storage.local_root, bucket)),
        StorageBackend::Memory => Arc::new(MemoryStorage::new(bucket)),
    };
    Ok(storage)
}

/// Normalize a user-supplied prefix: no leading or trailing slashes.
pub(crate) fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

/// Shared object operations over an `object_store` implementation.
pub(crate) struct ObjectOps {
    store: Arc<dyn ObjectStore>,
}

impl ObjectOps {
    pub(crate) fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub(crate) async fn put(&self, path: &str, bytes: Bytes) -> Result<()> {
        self.store
            .put(&ObjectPath::from(path), PutPayload::from_bytes(bytes))
            .await
            .map_err(|e| object_error("put", path, e))?;
        Ok(())
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&ObjectPath::from(path))
            .await
            .map_err(|e| object_error("get", path, e))?;
        result
            .bytes()
            .await
            .map_err(|e| object_error("get", path, e))
    }

    pub(crate) async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&ObjectPath::from(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(object_error("head", path, e)),
        }
    }

    pub(crate) async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_prefix(prefix);
        let location = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let objects: Vec<_> = self
            .store
            .list(location.as_ref())
            .try_collect()
            .await
            .map_err(|e| object_error("list", prefix, e))?;

        let mut paths: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub(crate) async fn delete(&self, prefix: &str) -> Result<usize> {
        let paths = self.list(prefix).await?;
        for path in &paths {
            match self.store.delete(&ObjectPath::from(path.as_str())).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(object_error("delete", path, e)),
            }
        }
        Ok(paths.len())
    }
}

fn object_error(operation: &'static str, path: &str, err: object_store::Error) -> crate::Error {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_string()).into(),
        other => StorageError::Object {
            operation,
            path: path.to_string(),
            message: other.to_string(),
        }
        .into(),
    }
}
