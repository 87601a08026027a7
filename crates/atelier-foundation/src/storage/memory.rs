//! In-memory object store.

use async_trait::async_trait;
use atelier_kernel::error::{EngineError, EngineResult};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::ObjectStore;

/// Bucket-shaped map for tests and single-process runs.
pub struct InMemoryObjectStore {
    bucket: String,
    objects: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, mime_type: &str, bytes: Vec<u8>) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::validation("object key must not be empty"));
        }
        self.objects
            .write()
            .await
            .insert(key.to_string(), (mime_type.to_string(), bytes));
        Ok(())
    }

    async fn get(&self, key: &str) -> EngineResult<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| EngineError::Storage(format!("object not found: {key}")))
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://{}.s3.amazonaws.com/{key}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = InMemoryObjectStore::new("test-bucket");
        store
            .put("a/b/c.png", "image/png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(store.get("a/b/c.png").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_key_is_a_storage_error() {
        let store = InMemoryObjectStore::new("test-bucket");
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[tokio::test]
    async fn public_url_derives_from_bucket() {
        let store = InMemoryObjectStore::new("my-bucket");
        assert_eq!(
            store.public_url("x/y.jpg"),
            "https://my-bucket.s3.amazonaws.com/x/y.jpg"
        );
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let store = InMemoryObjectStore::new("b");
        assert!(store.put("", "image/png", vec![]).await.is_err());
    }
}
