//! Deterministic mock generator.

use async_trait::async_trait;
use atelier_kernel::error::EngineResult;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;

use super::{EditOptions, GenerateOptions, ImageData, ImageGenerator};

/// A 1x1 transparent PNG.
const PLACEHOLDER_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

static PLACEHOLDER_PNG: Lazy<Vec<u8>> = Lazy::new(|| {
    STANDARD
        .decode(PLACEHOLDER_PNG_BASE64)
        .expect("placeholder PNG constant is valid base64")
});

/// Returns the placeholder PNG for every request. Selected by
/// `IMAGE_GEN_MOCK`; used throughout the test suite.
#[derive(Debug, Default, Clone)]
pub struct MockImageGenerator;

impl MockImageGenerator {
    pub fn new() -> Self {
        Self
    }

    /// The bytes every call returns.
    pub fn placeholder_bytes() -> &'static [u8] {
        &PLACEHOLDER_PNG
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        _prompt: &str,
        count: u32,
        _opts: &GenerateOptions,
    ) -> EngineResult<Vec<ImageData>> {
        Ok((0..count)
            .map(|_| ImageData {
                bytes: PLACEHOLDER_PNG.clone(),
                mime_type: "image/png".to_string(),
            })
            .collect())
    }

    async fn edit(
        &self,
        _source_base64: &str,
        _instruction: &str,
        count: u32,
        _opts: &EditOptions,
    ) -> EngineResult<Vec<ImageData>> {
        Ok((0..count)
            .map(|_| ImageData {
                bytes: PLACEHOLDER_PNG.clone(),
                mime_type: "image/png".to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_requested_count_deterministically() {
        let generator = MockImageGenerator::new();
        let first = generator
            .generate("a cat", 3, &GenerateOptions::default())
            .await
            .unwrap();
        let second = generator
            .generate("a dog", 3, &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].bytes, second[0].bytes);
        assert_eq!(first[0].mime_type, "image/png");
    }

    #[tokio::test]
    async fn placeholder_is_a_png() {
        let bytes = MockImageGenerator::placeholder_bytes();
        assert_eq!(&bytes[1..4], &b"PNG"[..]);
    }

    #[tokio::test]
    async fn edit_is_supported() {
        let generator = MockImageGenerator::new();
        let edited = generator
            .edit("aGk=", "brighten", 2, &EditOptions::default())
            .await
            .unwrap();
        assert_eq!(edited.len(), 2);
    }
}
