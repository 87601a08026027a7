//! Object storage: the put/get trait, key conventions and public URLs.

pub mod memory;

pub use memory::InMemoryObjectStore;

use async_trait::async_trait;
use atelier_kernel::error::EngineResult;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Minimal object-store surface the engine requires.
///
/// ACL policy is the implementation's concern; the trait carries none.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key with the given MIME type.
    async fn put(&self, key: &str, mime_type: &str, bytes: Vec<u8>) -> EngineResult<()>;

    /// Fetch bytes by key.
    async fn get(&self, key: &str) -> EngineResult<Vec<u8>>;

    /// Public URL for a key, derived by convention from the bucket.
    fn public_url(&self, key: &str) -> String;
}

/// Shared, dynamically dispatched object-store handle.
pub type DynObjectStore = Arc<dyn ObjectStore>;

/// Key for a generated image.
pub fn image_key(organization_id: Uuid, request_id: Uuid, image_id: Uuid) -> String {
    format!("image-generation/{organization_id}/{request_id}/{image_id}.jpg")
}

/// Key for an uploaded judge document, timestamped to keep re-uploads apart.
pub fn document_key(organization_id: Uuid, agent_id: Uuid, filename: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    format!("agent-documents/{organization_id}/{agent_id}/{ts}-{filename}")
}

/// Key for a compliance-captured image.
pub fn compliance_key(organization_id: Uuid, extension: &str) -> String {
    format!("compliance-images/{organization_id}/{}.{extension}", Uuid::new_v4())
}
