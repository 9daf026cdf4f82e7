//! Local filesystem storage. Each bucket is a directory under a root.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{ObjectOps, ObjectStorage};
use crate::error::StorageError;
use crate::Result;

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    bucket: String,
    dir: PathBuf,
}

impl LocalStorage {
    /// Storage for `bucket` under `root`.
    pub fn new(root: &Path, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(root))
                .unwrap_or_else(|_| root.to_path_buf())
        };
        let dir = root.join(&bucket);
        Self { bucket, dir }
    }

    /// Directory backing the bucket.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ops(&self) -> Result<ObjectOps> {
        if !self.dir.is_dir() {
            return Err(StorageError::BucketNotFound(self.bucket.clone()).into());
        }
        let fs = LocalFileSystem::new_with_prefix(&self.dir).map_err(|e| StorageError::Bucket {
            bucket: self.bucket.clone(),
            message: e.to_string(),
        })?;
        Ok(ObjectOps::new(Arc::new(fs)))
    }

    fn bucket_error(&self, err: std::io::Error) -> crate::Error {
        StorageError::Bucket {
            bucket: self.bucket.clone(),
            message: err.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn uri(&self, path: &str) -> String {
        format!(
            "file://{}/{}",
            self.dir.display(),
            path.trim_start_matches('/')
        )
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_bucket(&self, _region: &str) -> Result<()> {
        debug!(dir = %self.dir.display(), "Creating local bucket directory");
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.bucket_error(e))
    }

    async fn delete_bucket(&self) -> Result<()> {
        let remaining = self.ops()?.list("").await?;
        if !remaining.is_empty() {
            return Err(StorageError::Bucket {
                bucket: self.bucket.clone(),
                message: format!("bucket is not empty ({} objects)", remaining.len()),
            }
            .into());
        }
        // Only empty directories remain
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| self.bucket_error(e))
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<String> {
        self.ops()?.put(path, bytes).await?;
        Ok(self.uri(path))
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.ops()?.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.ops()?.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.ops()?.list(prefix).await
    }

    async fn delete(&self, prefix: &str) -> Result<usize> {
        self.ops()?.delete(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_lifecycle() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path(), "lake");

        assert!(!storage.bucket_exists().await.unwrap());
        storage.create_bucket("local").await.unwrap();
        assert!(storage.bucket_exists().await.unwrap());

        let uri = storage
            .put("iceberg-tables/t/data/a.parquet", Bytes::from_static(b"PAR1"))
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("/lake/iceberg-tables/t/data/a.parquet"));

        assert!(storage
            .exists("iceberg-tables/t/data/a.parquet")
            .await
            .unwrap());
        assert!(!storage.exists("iceberg-tables/t/data/b.parquet").await.unwrap());
        assert_eq!(
            storage.list("iceberg-tables/t").await.unwrap(),
            vec!["iceberg-tables/t/data/a.parquet"]
        );

        assert!(storage.delete_bucket().await.is_err());
        assert_eq!(storage.delete("iceberg-tables").await.unwrap(), 1);
        storage.delete_bucket().await.unwrap();
        assert!(!storage.bucket_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_local_storage_missing_bucket() {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp.path(), "absent");
        let err = storage.list("").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::BucketNotFound(_))
        ));
    }
}
