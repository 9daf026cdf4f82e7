//! In-memory object storage with operation tracing.
//!
//! Used for simulation runs and tests. Every call is recorded, and failures
//! can be injected for any path prefix to exercise partial commits.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{normalize_prefix, ObjectStorage};
use crate::error::StorageError;
use crate::Result;

/// Record of a storage operation for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    BucketExists,
    CreateBucket { region: String },
    DeleteBucket,
    Put { path: String, size: usize },
    Get { path: String },
    Exists { path: String },
    List { prefix: String },
    Delete { prefix: String },
}

#[derive(Debug, Default)]
struct State {
    bucket_exists: bool,
    objects: BTreeMap<String, Bytes>,
    operations: Vec<StorageOp>,
    fail_paths: Vec<String>,
    fail_bucket_ops: bool,
}

/// In-memory storage backend. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    /// Create storage for a bucket that does not exist yet.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Create storage whose bucket already exists.
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let storage = Self::new(bucket);
        storage.state.lock().bucket_exists = true;
        storage
    }

    /// All recorded operations.
    pub fn operations(&self) -> Vec<StorageOp> {
        self.state.lock().operations.clone()
    }

    /// Clear recorded operations.
    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    /// Number of bucket creations recorded.
    pub fn create_calls(&self) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| matches!(op, StorageOp::CreateBucket { .. }))
            .count()
    }

    /// Number of object writes recorded.
    pub fn put_calls(&self) -> usize {
        self.state
            .lock()
            .operations
            .iter()
            .filter(|op| matches!(op, StorageOp::Put { .. }))
            .count()
    }

    /// Fail every object operation whose path starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.state.lock().fail_paths.push(prefix.into());
    }

    /// Fail bucket creation and deletion.
    pub fn fail_bucket_operations(&self, fail: bool) {
        self.state.lock().fail_bucket_ops = fail;
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_paths.clear();
        state.fail_bucket_ops = false;
    }

    /// Stored object paths.
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    fn record(&self, op: StorageOp) {
        self.state.lock().operations.push(op);
    }

    fn check(&self, path: &str, operation: &'static str) -> Result<()> {
        let state = self.state.lock();
        if !state.bucket_exists {
            return Err(StorageError::BucketNotFound(self.bucket.clone()).into());
        }
        if state.fail_paths.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(StorageError::Object {
                operation,
                path: path.to_string(),
                message: "injected failure".into(),
            }
            .into());
        }
        Ok(())
    }

    fn check_bucket_op(&self) -> Result<()> {
        if self.state.lock().fail_bucket_ops {
            return Err(StorageError::Bucket {
                bucket: self.bucket.clone(),
                message: "injected failure".into(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn uri(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path.trim_start_matches('/'))
    }

    async fn bucket_exists(&self) -> Result<bool> {
        self.record(StorageOp::BucketExists);
        Ok(self.state.lock().bucket_exists)
    }

    async fn create_bucket(&self, region: &str) -> Result<()> {
        self.record(StorageOp::CreateBucket {
            region: region.to_string(),
        });
        self.check_bucket_op()?;
        self.state.lock().bucket_exists = true;
        Ok(())
    }

    async fn delete_bucket(&self) -> Result<()> {
        self.record(StorageOp::DeleteBucket);
        self.check_bucket_op()?;
        let mut state = self.state.lock();
        if !state.bucket_exists {
            return Err(StorageError::BucketNotFound(self.bucket.clone()).into());
        }
        if !state.objects.is_empty() {
            return Err(StorageError::Bucket {
                bucket: self.bucket.clone(),
                message: format!("bucket is not empty ({} objects)", state.objects.len()),
            }
            .into());
        }
        state.bucket_exists = false;
        Ok(())
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<String> {
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: bytes.len(),
        });
        self.check(path, "put")?;
        self.state.lock().objects.insert(path.to_string(), bytes);
        Ok(self.uri(path))
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.check(path, "get")?;
        self.state
            .lock()
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()).into())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.record(StorageOp::Exists {
            path: path.to_string(),
        });
        self.check(path, "head")?;
        Ok(self.state.lock().objects.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_prefix(prefix);
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.check(prefix, "list")?;
        Ok(self
            .state
            .lock()
            .objects
            .keys()
            .filter(|path| is_under(path, prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, prefix: &str) -> Result<usize> {
        let prefix = normalize_prefix(prefix);
        self.record(StorageOp::Delete {
            prefix: prefix.to_string(),
        });
        self.check(prefix, "delete")?;
        let mut state = self.state.lock();
        let before = state.objects.len();
        state.objects.retain(|path, _| !is_under(path, prefix));
        Ok(before - state.objects.len())
    }
}

/// Prefix match on whole path segments, like object_store listing.
fn is_under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let storage = MemoryStorage::with_bucket("lake");
        storage
            .put("t/metadata/v1.metadata.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        storage
            .put("t/data/part-0.parquet", Bytes::from_static(b"PAR1"))
            .await
            .unwrap();
        storage
            .put("tx/other.json", Bytes::from_static(b"[]"))
            .await
            .unwrap();

        assert!(storage.exists("t/data/part-0.parquet").await.unwrap());
        assert_eq!(
            storage.get("t/metadata/v1.metadata.json").await.unwrap(),
            Bytes::from_static(b"{}")
        );
        assert_eq!(
            storage.list("t/").await.unwrap(),
            vec!["t/data/part-0.parquet", "t/metadata/v1.metadata.json"]
        );

        assert_eq!(storage.delete("t").await.unwrap(), 2);
        assert_eq!(storage.paths(), vec!["tx/other.json"]);
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let storage = MemoryStorage::new("lake");
        assert!(!storage.bucket_exists().await.unwrap());
        assert!(storage.put("a", Bytes::new()).await.is_err());

        storage.create_bucket("us-central1").await.unwrap();
        assert!(storage.bucket_exists().await.unwrap());
        assert_eq!(storage.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_bucket_requires_empty() {
        let storage = MemoryStorage::with_bucket("lake");
        storage.put("a/b", Bytes::from_static(b"x")).await.unwrap();
        assert!(storage.delete_bucket().await.is_err());

        storage.delete("").await.unwrap();
        storage.delete_bucket().await.unwrap();
        assert!(!storage.bucket_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let storage = MemoryStorage::with_bucket("lake");
        storage.inject_failure("t/metadata/snap-2");

        let err = storage
            .put("t/metadata/snap-2-manifest.json", Bytes::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert!(storage
            .put("t/metadata/snap-1-manifest.json", Bytes::new())
            .await
            .is_ok());

        storage.clear_failures();
        assert!(storage
            .put("t/metadata/snap-2-manifest.json", Bytes::new())
            .await
            .is_ok());
    }
}
