//! Engine configuration.
//!
//! Env-driven with builder-style overrides; every knob has a workable
//! default so tests never need the environment.

use std::path::PathBuf;

/// Environment-derived configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Object-store bucket name; public URLs derive from it.
    pub storage_bucket: String,
    /// API key for the model backend.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible backend.
    pub api_base_url: String,
    /// High-capability judge/optimizer model.
    pub model_pro: String,
    /// Low-latency judge model.
    pub model_flash: String,
    pub embedding_model: String,
    pub image_model: String,
    /// Use the deterministic placeholder generator instead of the backend.
    pub mock_images: bool,
    /// Dump generated image bytes to `debug_dir` for inspection.
    pub debug_output: bool,
    pub debug_dir: PathBuf,
    /// Bind address of the handoff HTTP surface.
    pub bind_addr: String,
    /// Bearer token expected on the SSE endpoint, if set.
    pub stream_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_bucket: "atelier-dev".to_string(),
            api_key: String::new(),
            api_base_url: "https://api.openai.com".to_string(),
            model_pro: "gpt-4o".to_string(),
            model_flash: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            image_model: "gpt-image-1".to_string(),
            mock_images: false,
            debug_output: false,
            debug_dir: PathBuf::from("./debug-images"),
            bind_addr: "0.0.0.0:8080".to_string(),
            stream_token: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(bucket) = std::env::var("ATELIER_STORAGE_BUCKET") {
            cfg.storage_bucket = bucket;
        }
        if let Ok(key) = std::env::var("ATELIER_API_KEY") {
            cfg.api_key = key;
        }
        if let Ok(base) = std::env::var("ATELIER_API_BASE_URL") {
            cfg.api_base_url = base;
        }
        if let Ok(model) = std::env::var("ATELIER_MODEL_PRO") {
            cfg.model_pro = model;
        }
        if let Ok(model) = std::env::var("ATELIER_MODEL_FLASH") {
            cfg.model_flash = model;
        }
        if let Ok(model) = std::env::var("ATELIER_EMBEDDING_MODEL") {
            cfg.embedding_model = model;
        }
        if let Ok(model) = std::env::var("ATELIER_IMAGE_MODEL") {
            cfg.image_model = model;
        }
        cfg.mock_images = env_flag("IMAGE_GEN_MOCK");
        cfg.debug_output = env_flag("IMAGE_GEN_DEBUG_OUTPUT");
        if let Ok(dir) = std::env::var("IMAGE_GEN_DEBUG_DIR") {
            cfg.debug_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("ATELIER_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Ok(token) = std::env::var("ATELIER_STREAM_TOKEN") {
            cfg.stream_token = Some(token);
        }
        cfg
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.storage_bucket = bucket.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_mock_images(mut self, mock: bool) -> Self {
        self.mock_images = mock;
        self
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}
