//! Google Cloud Storage backend.
//!
//! Objects go through `object_store`'s GCS client; bucket lifecycle uses the
//! JSON API since `object_store` has no bucket administration.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ObjectOps, ObjectStorage};
use crate::error::StorageError;
use crate::http::{GoogleApiClient, Service};
use crate::Result;

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";

/// Google Cloud Storage backend.
pub struct GcsStorage {
    bucket: String,
    project_id: String,
    objects: ObjectOps,
    api: Arc<GoogleApiClient>,
}

impl GcsStorage {
    /// Storage for `bucket` owned by `project_id`.
    ///
    /// Object credentials are resolved by `object_store` from the environment
    /// (`GOOGLE_SERVICE_ACCOUNT`, `GOOGLE_APPLICATION_CREDENTIALS`, or the
    /// metadata server).
    pub fn new(bucket: String, project_id: &str, api: Arc<GoogleApiClient>) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&bucket)
            .build()
            .map_err(|e| StorageError::Bucket {
                bucket: bucket.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            bucket,
            project_id: project_id.to_string(),
            objects: ObjectOps::new(Arc::new(store)),
            api,
        })
    }

    fn bucket_url(&self) -> String {
        format!("{}/b/{}", STORAGE_API, urlencoding::encode(&self.bucket))
    }

    fn bucket_error(&self, message: impl Into<String>) -> crate::Error {
        StorageError::Bucket {
            bucket: self.bucket.clone(),
            message: message.into(),
        }
        .into()
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn uri(&self, path: &str) -> String {
        format!("gs://{}/{}", self.bucket, path.trim_start_matches('/'))
    }

    async fn bucket_exists(&self) -> Result<bool> {
        let response = self
            .api
            .send(Service::Storage, Method::GET, &self.bucket_url(), None)
            .await?;
        match response.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.bucket_error(response.error_message())),
        }
    }

    async fn create_bucket(&self, region: &str) -> Result<()> {
        let url = format!(
            "{}/b?project={}",
            STORAGE_API,
            urlencoding::encode(&self.project_id)
        );
        let body = json!({
            "name": self.bucket,
            "location": region,
            "iamConfiguration": { "uniformBucketLevelAccess": { "enabled": true } },
        });
        let response = self
            .api
            .send(Service::Storage, Method::POST, &url, Some(&body))
            .await?;

        match response.status {
            s if s.is_success() => {
                info!(bucket = %self.bucket, region, "Created bucket");
                Ok(())
            }
            StatusCode::CONFLICT => {
                // Bucket names are global; 409 means it exists, possibly elsewhere
                debug!(bucket = %self.bucket, "Bucket already exists");
                Ok(())
            }
            _ => Err(self.bucket_error(response.error_message())),
        }
    }

    async fn delete_bucket(&self) -> Result<()> {
        let response = self
            .api
            .send(Service::Storage, Method::DELETE, &self.bucket_url(), None)
            .await?;
        match response.status {
            s if s.is_success() => {
                info!(bucket = %self.bucket, "Deleted bucket");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(StorageError::BucketNotFound(self.bucket.clone()).into()),
            _ => Err(self.bucket_error(response.error_message())),
        }
    }

    async fn put(&self, path: &str, bytes: Bytes) -> Result<String> {
        self.objects.put(path, bytes).await?;
        Ok(self.uri(path))
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.objects.get(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.objects.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.objects.list(prefix).await
    }

    async fn delete(&self, prefix: &str) -> Result<usize> {
        self.objects.delete(prefix).await
    }
}
