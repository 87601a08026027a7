//! Image generation: the generator trait, a deterministic mock and an
//! OpenAI-compatible HTTP backend.

pub mod http;
pub mod mock;

pub use http::{HttpImageGenerator, ImageBackendConfig};
pub use mock::MockImageGenerator;

use async_trait::async_trait;
use atelier_kernel::error::{EngineError, EngineResult};
use std::sync::Arc;

/// Raw output of one generated candidate.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Options for text-to-image generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub aspect_ratio: String,
    pub quality: String,
    /// Fetched once per batch and shared across the generations.
    pub reference_image_urls: Vec<String>,
}

/// Options for instruction-based editing.
#[derive(Debug, Clone, Default)]
pub struct EditOptions {
    pub aspect_ratio: String,
}

/// Abstract text→image and image+instruction→image backend.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Generate `count` candidates for a prompt in one batch.
    async fn generate(
        &self,
        prompt: &str,
        count: u32,
        opts: &GenerateOptions,
    ) -> EngineResult<Vec<ImageData>>;

    /// Apply an edit instruction to a source image (base64-encoded),
    /// producing `count` candidates. Optional; the default refuses.
    async fn edit(
        &self,
        _source_base64: &str,
        _instruction: &str,
        _count: u32,
        _opts: &EditOptions,
    ) -> EngineResult<Vec<ImageData>> {
        Err(EngineError::Validation(format!(
            "backend {} does not support editing",
            self.name()
        )))
    }
}

/// Shared, dynamically dispatched generator handle.
pub type DynImageGenerator = Arc<dyn ImageGenerator>;
