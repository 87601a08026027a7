//! OpenAI-compatible chat and embedding provider.
//!
//! Speaks the `/v1/chat/completions` and `/v1/embeddings` wire format over
//! reqwest. 408/429/5xx responses and transport failures map to the
//! retryable backend error kind; everything else propagates as validation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::llm::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
    LlmProvider,
};

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL (default: `https://api.openai.com`).
    pub base_url: String,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            timeout_secs: 120,
        }
    }
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self {
            api_key: std::env::var("ATELIER_API_KEY").unwrap_or_default(),
            ..Default::default()
        };
        if let Ok(base_url) = std::env::var("ATELIER_API_BASE_URL") {
            cfg.base_url = base_url;
        }
        cfg
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// OpenAI-compatible provider (chat + embeddings, multimodal user content).
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> EngineResult<Self> {
        Self::with_config(OpenAiConfig::new(api_key))
    }

    pub fn from_env() -> EngineResult<Self> {
        Self::with_config(OpenAiConfig::from_env())
    }

    pub fn with_config(config: OpenAiConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> EngineResult<R>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("{path} returned {status}: {}", truncate(&text, 500));
            return Err(if is_retryable_status(status) {
                EngineError::Backend(message)
            } else {
                EngineError::Validation(message)
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| EngineError::Serialization(format!("{path} response: {e}")))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_vision(&self) -> bool {
        true
    }

    fn supports_embedding(&self) -> bool {
        true
    }

    async fn chat(&self, request: ChatCompletionRequest) -> EngineResult<ChatCompletionResponse> {
        if request.messages.is_empty() {
            return Err(EngineError::validation("chat request has no messages"));
        }
        self.post_json("/v1/chat/completions", &request).await
    }

    async fn embedding(&self, request: EmbeddingRequest) -> EngineResult<EmbeddingResponse> {
        if request.input.is_empty() {
            return Err(EngineError::validation("embedding request has no input"));
        }
        self.post_json("/v1/embeddings", &request).await
    }

    async fn health_check(&self) -> EngineResult<bool> {
        let response = self
            .client
            .get(self.endpoint("/v1/models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_classification() {
        use reqwest::StatusCode;
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn config_builder() {
        let cfg = OpenAiConfig::new("sk-test")
            .with_base_url("http://localhost:8000/")
            .with_timeout(30);
        assert_eq!(cfg.api_key, "sk-test");
        assert_eq!(cfg.timeout_secs, 30);

        let provider = OpenAiProvider::with_config(cfg).unwrap();
        assert_eq!(
            provider.endpoint("/v1/chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn empty_chat_request_is_rejected_before_the_wire() {
        let provider = OpenAiProvider::new("sk-test").unwrap();
        let err = provider
            .chat(ChatCompletionRequest::new("gpt-4o-mini"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
