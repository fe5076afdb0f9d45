use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::errors::{ExportError, PipelineResult, StorageResult};

/// Object-storage providers an export can be delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    Azure,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Azure => "azure",
        }
    }

    /// Scheme used in canonical object URIs
    pub fn uri_scheme(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::Azure => "az",
        }
    }
}

/// Where a finished export should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDestination {
    pub provider: StorageProvider,
    /// Bucket (S3) or container (Azure)
    pub bucket: String,
    /// Object key; a dated default is derived when absent
    pub key: Option<String>,
}

impl UploadDestination {
    pub fn new(provider: StorageProvider, bucket: &str) -> Self {
        Self {
            provider,
            bucket: bucket.to_string(),
            key: None,
        }
    }
}

/// Headers attached to a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectOptions {
    pub content_type: String,
    pub server_side_encryption: bool,
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

/// Receipt for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Minimal object-storage capability the upload protocol runs against.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    fn provider(&self) -> StorageProvider;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &ObjectOptions,
    ) -> StorageResult<()>;

    /// Start a multipart session and return its upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &ObjectOptions,
    ) -> StorageResult<String>;

    /// Upload one part and return its entity tag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StorageResult<String>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> StorageResult<()>;

    fn object_uri(&self, bucket: &str, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}://{}/{}", self.provider().uri_scheme(), bucket, encoded.join("/"))
    }
}

/// Storage backends keyed by provider.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    backends: HashMap<StorageProvider, Arc<dyn ObjectStorage>>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("providers", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ObjectStorage>) -> &mut Self {
        self.backends.insert(backend.provider(), backend);
        self
    }

    pub fn get(&self, provider: StorageProvider) -> PipelineResult<Arc<dyn ObjectStorage>> {
        self.backends.get(&provider).cloned().ok_or_else(|| {
            ExportError::CapabilityUnavailable(format!(
                "No storage backend registered for provider '{}'",
                provider.as_str()
            ))
        })
    }
}

#[cfg(test)]
pub use mock::InMemoryObjectStorage;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reports_missing_provider() {
        let mut registry = StorageRegistry::new();
        registry.register(Arc::new(InMemoryObjectStorage::new(StorageProvider::S3)));

        assert!(registry.get(StorageProvider::S3).is_ok());
        let err = registry.get(StorageProvider::Azure).err().unwrap();
        assert_eq!(err.code(), "CAPABILITY_UNAVAILABLE");
    }

    #[test]
    fn test_object_uri_per_provider() {
        let s3 = InMemoryObjectStorage::new(StorageProvider::S3);
        let azure = InMemoryObjectStorage::new(StorageProvider::Azure);
        assert_eq!(s3.object_uri("bucket", "exports/a b.csv"), "s3://bucket/exports/a%20b.csv");
        assert_eq!(azure.object_uri("container", "x/y.json"), "az://container/x/y.json");
    }

    #[test]
    fn test_destination_deserializes_lowercase_provider() {
        let dest: UploadDestination =
            serde_json::from_str(r#"{"provider":"azure","bucket":"c","key":null}"#).unwrap();
        assert_eq!(dest, UploadDestination::new(StorageProvider::Azure, "c"));
    }
}
