//! OpenAI-compatible HTTP image backend.
//!
//! Generation batches into a single `n = count` call. Reference images are
//! fetched once per batch and shipped base64-encoded; a failed fetch skips
//! that reference with a warning instead of failing the generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use atelier_kernel::error::{EngineError, EngineResult};

use super::{EditOptions, GenerateOptions, ImageData, ImageGenerator};
use crate::llm::vision;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct ImageBackendConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Dump generated bytes to `debug_dir` when set.
    pub debug_output: bool,
    pub debug_dir: PathBuf,
}

impl Default for ImageBackendConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-image-1".to_string(),
            timeout_secs: 180,
            debug_output: false,
            debug_dir: PathBuf::from("./debug-images"),
        }
    }
}

impl ImageBackendConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_debug_output(mut self, dir: PathBuf) -> Self {
        self.debug_output = true;
        self.debug_dir = dir;
        self
    }
}

#[derive(Serialize)]
struct GenerationsBody<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reference_images: Vec<String>,
}

#[derive(Serialize)]
struct EditsBody<'a> {
    model: &'a str,
    image: &'a str,
    prompt: &'a str,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImagePayload>,
}

#[derive(Deserialize)]
struct ImagePayload {
    b64_json: String,
}

/// reqwest-backed generator speaking `/v1/images/*`.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    config: ImageBackendConfig,
}

impl HttpImageGenerator {
    pub fn with_config(config: ImageBackendConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Fetch reference images once for a batch; failures are skipped.
    async fn fetch_references(&self, urls: &[String]) -> Vec<String> {
        let mut references = Vec::with_capacity(urls.len());
        for url in urls {
            match self.fetch_reference(url).await {
                Ok(encoded) => references.push(encoded),
                Err(e) => {
                    warn!(%url, error = %e, "skipping unreachable reference image");
                }
            }
        }
        references
    }

    async fn fetch_reference(&self, url: &str) -> EngineResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("reference fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Backend(format!(
                "reference fetch returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Backend(format!("reference body read failed: {e}")))?;
        Ok(vision::encode_base64(&bytes))
    }

    async fn post_images<B: Serialize>(&self, path: &str, body: &B) -> EngineResult<Vec<ImageData>> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("image request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(500).collect();
            let message = format!("{path} returned {status}: {preview}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                EngineError::Backend(message)
            } else {
                EngineError::Validation(message)
            });
        }

        let parsed: ImagesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Serialization(format!("image response: {e}")))?;

        let mut images = Vec::with_capacity(parsed.data.len());
        for payload in parsed.data {
            let bytes = vision::decode_base64(&payload.b64_json)?;
            let mime_type = vision::detect_mime_type(&bytes).unwrap_or_else(|_| "image/png".into());
            images.push(ImageData { bytes, mime_type });
        }

        if self.config.debug_output {
            self.debug_dump(&images).await;
        }
        Ok(images)
    }

    async fn debug_dump(&self, images: &[ImageData]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.config.debug_dir).await {
            warn!(error = %e, "could not create debug image directory");
            return;
        }
        for image in images {
            let ext = image.mime_type.rsplit('/').next().unwrap_or("png");
            let path = self.config.debug_dir.join(format!("{}.{ext}", Uuid::new_v4()));
            if let Err(e) = tokio::fs::write(&path, &image.bytes).await {
                warn!(error = %e, ?path, "debug image dump failed");
            } else {
                debug!(?path, "dumped generated image");
            }
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        prompt: &str,
        count: u32,
        opts: &GenerateOptions,
    ) -> EngineResult<Vec<ImageData>> {
        if prompt.trim().is_empty() {
            return Err(EngineError::validation("generation prompt must not be empty"));
        }
        let reference_images = self.fetch_references(&opts.reference_image_urls).await;
        let body = GenerationsBody {
            model: &self.config.model,
            prompt,
            n: count.max(1),
            size: aspect_ratio_to_size(&opts.aspect_ratio),
            quality: (!opts.quality.is_empty()).then_some(opts.quality.as_str()),
            reference_images,
        };
        self.post_images("/v1/images/generations", &body).await
    }

    async fn edit(
        &self,
        source_base64: &str,
        instruction: &str,
        count: u32,
        opts: &EditOptions,
    ) -> EngineResult<Vec<ImageData>> {
        if instruction.trim().is_empty() {
            return Err(EngineError::validation("edit instruction must not be empty"));
        }
        let body = EditsBody {
            model: &self.config.model,
            image: source_base64,
            prompt: instruction,
            n: count.max(1),
            size: aspect_ratio_to_size(&opts.aspect_ratio),
        };
        self.post_images("/v1/images/edits", &body).await
    }
}

/// Map an aspect ratio to the wire's pixel-size vocabulary.
fn aspect_ratio_to_size(aspect_ratio: &str) -> Option<String> {
    match aspect_ratio {
        "" => None,
        "1:1" => Some("1024x1024".to_string()),
        "16:9" => Some("1792x1024".to_string()),
        "9:16" => Some("1024x1792".to_string()),
        other => {
            debug!(aspect_ratio = other, "unmapped aspect ratio, letting the backend default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratios_map_to_sizes() {
        assert_eq!(aspect_ratio_to_size("1:1").as_deref(), Some("1024x1024"));
        assert_eq!(aspect_ratio_to_size("16:9").as_deref(), Some("1792x1024"));
        assert_eq!(aspect_ratio_to_size("9:16").as_deref(), Some("1024x1792"));
        assert!(aspect_ratio_to_size("4:3").is_none());
        assert!(aspect_ratio_to_size("").is_none());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_locally() {
        let generator =
            HttpImageGenerator::with_config(ImageBackendConfig::new("sk-test")).unwrap();
        let err = generator
            .generate("   ", 1, &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_edit_instruction_is_rejected_locally() {
        let generator =
            HttpImageGenerator::with_config(ImageBackendConfig::new("sk-test")).unwrap();
        let err = generator
            .edit("aGk=", "", 1, &EditOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn debug_dump_writes_one_file_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ImageBackendConfig::new("sk-test").with_debug_output(dir.path().to_path_buf());
        let generator = HttpImageGenerator::with_config(cfg).unwrap();
        let images = vec![
            ImageData {
                bytes: vec![1, 2, 3],
                mime_type: "image/png".into(),
            },
            ImageData {
                bytes: vec![4, 5, 6],
                mime_type: "image/jpeg".into(),
            },
        ];
        generator.debug_dump(&images).await;
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn config_builder() {
        let cfg = ImageBackendConfig::new("sk-x")
            .with_model("custom-image-model")
            .with_base_url("http://localhost:9000");
        assert_eq!(cfg.model, "custom-image-model");
        assert_eq!(cfg.base_url, "http://localhost:9000");
        assert!(!cfg.debug_output);
    }
}
