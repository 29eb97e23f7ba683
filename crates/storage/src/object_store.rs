//! Object storage interface for source granules and transcoded outputs (S3 compatible).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use object_store::{aws::AmazonS3Builder, memory::InMemory, path::Path, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use granule_common::{GranuleError, GranuleResult};

/// Configuration for object storage connection.
///
/// Unset credentials fall back to the standard `AWS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    /// Custom endpoint URL (MinIO, localstack); AWS when unset
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bucket name
    pub bucket: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Allow HTTP (for local MinIO)
    #[serde(default)]
    pub allow_http: bool,
}

fn default_region() -> String {
    "us-west-2".to_string()
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: "granule-outputs".to_string(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            region: default_region(),
            allow_http: false,
        }
    }
}

/// Temporary credentials for reading a bucket owned by another account.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Listing entry for an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Object storage client bound to a single bucket.
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectStorage {
    /// Create a new object storage client from config.
    pub fn new(config: &ObjectStorageConfig) -> GranuleResult<Self> {
        Self::build(config, None)
    }

    /// Create a client that authenticates with explicitly supplied credentials.
    pub fn with_credentials(
        config: &ObjectStorageConfig,
        credentials: &StorageCredentials,
    ) -> GranuleResult<Self> {
        Self::build(config, Some(credentials))
    }

    fn build(
        config: &ObjectStorageConfig,
        credentials: Option<&StorageCredentials>,
    ) -> GranuleResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        let access = credentials
            .map(|c| (c.access_key_id.clone(), c.secret_access_key.clone(), c.session_token.clone()))
            .or_else(|| match (&config.access_key_id, &config.secret_access_key) {
                (Some(key), Some(secret)) => {
                    Some((key.clone(), secret.clone(), config.session_token.clone()))
                }
                _ => None,
            });
        if let Some((key, secret, token)) = access {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
            if let Some(token) = token {
                builder = builder.with_token(token);
            }
        }

        let store = builder
            .build()
            .map_err(|e| GranuleError::StorageError(format!("Failed to create S3 client: {}", e)))?;

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
        })
    }

    /// Wrap an existing store, e.g. a local or in-memory one.
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// In-memory bucket, used by tests and dry runs.
    pub fn in_memory(bucket: impl Into<String>) -> Self {
        Self::from_store(Arc::new(InMemory::new()), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `s3://{bucket}/{key}` for a key in this bucket.
    pub fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    /// Resolve an `s3://` URI to a key, requiring it to point into this bucket.
    pub fn key_for_uri(&self, uri: &str) -> GranuleResult<String> {
        let (bucket, key) = parse_object_uri(uri)?;
        if bucket != self.bucket {
            return Err(GranuleError::InvalidUri(format!(
                "{} is outside bucket {}",
                uri, self.bucket
            )));
        }
        Ok(key)
    }

    /// Write bytes to a path in the bucket.
    #[instrument(skip(self, data), fields(bucket = %self.bucket, path = %path))]
    pub async fn put(&self, path: &str, data: Bytes) -> GranuleResult<()> {
        let location = Path::from(path);
        debug!(size = data.len(), "Writing object");

        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| GranuleError::StorageError(format!("Failed to write {}: {}", path, e)))?;

        Ok(())
    }

    /// Read bytes from a path.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn get(&self, path: &str) -> GranuleResult<Bytes> {
        let location = Path::from(path);

        let result = self.store.get(&location).await.map_err(|e| map_error(path, e))?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| GranuleError::StorageError(format!("Failed to read bytes: {}", e)))?;

        debug!(size = bytes.len(), "Read object");
        Ok(bytes)
    }

    /// Read a byte range from a path. `end` is clamped to the object size.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn get_range(&self, path: &str, start: usize, end: usize) -> GranuleResult<Bytes> {
        let size = self.size(path).await? as usize;
        let end = end.min(size);
        if start >= end {
            return Ok(Bytes::new());
        }

        let location = Path::from(path);
        self.store
            .get_range(&location, start..end)
            .await
            .map_err(|e| map_error(path, e))
    }

    /// Size of an object in bytes.
    pub async fn size(&self, path: &str) -> GranuleResult<u64> {
        let location = Path::from(path);
        let meta = self.store.head(&location).await.map_err(|e| map_error(path, e))?;
        Ok(meta.size as u64)
    }

    /// Check if an object exists.
    pub async fn exists(&self, path: &str) -> GranuleResult<bool> {
        let location = Path::from(path);

        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(GranuleError::StorageError(format!(
                "Failed to check {}: {}",
                path, e
            ))),
        }
    }

    /// Lazily list objects under a prefix. An empty prefix lists the whole bucket.
    pub fn list_stream(&self, prefix: &str) -> BoxStream<'_, GranuleResult<ObjectInfo>> {
        let prefix_path = (!prefix.is_empty()).then(|| Path::from(prefix));

        self.store
            .list(prefix_path.as_ref())
            .map(|item| {
                item.map(|meta| ObjectInfo {
                    key: meta.location.to_string(),
                    size: meta.size as u64,
                    last_modified: meta.last_modified,
                })
                .map_err(|e| GranuleError::StorageError(format!("List failed: {}", e)))
            })
            .boxed()
    }

    /// List all keys under a prefix.
    pub async fn list(&self, prefix: &str) -> GranuleResult<Vec<String>> {
        use futures::TryStreamExt;

        self.list_stream(prefix)
            .map_ok(|info| info.key)
            .try_collect()
            .await
    }

    /// Delete an object.
    #[instrument(skip(self), fields(bucket = %self.bucket, path = %path))]
    pub async fn delete(&self, path: &str) -> GranuleResult<()> {
        let location = Path::from(path);

        self.store
            .delete(&location)
            .await
            .map_err(|e| GranuleError::StorageError(format!("Failed to delete {}: {}", path, e)))?;

        Ok(())
    }
}

fn map_error(path: &str, err: object_store::Error) -> GranuleError {
    match err {
        object_store::Error::NotFound { .. } => GranuleError::NotFound(path.to_string()),
        other => GranuleError::StorageError(format!("Failed to read {}: {}", path, other)),
    }
}

/// Split `s3://bucket/key` into `(bucket, key)`.
pub fn parse_object_uri(uri: &str) -> GranuleResult<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| GranuleError::InvalidUri(uri.to_string()))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| GranuleError::InvalidUri(uri.to_string()))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(GranuleError::InvalidUri(uri.to_string()));
    }
    Ok((bucket.to_string(), key.to_string()))
}
