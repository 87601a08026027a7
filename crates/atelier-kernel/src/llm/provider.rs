use async_trait::async_trait;
use std::sync::Arc;

use super::types::*;
use crate::error::{EngineError, EngineResult};

/// Canonical LLM provider trait.
///
/// Chat is mandatory; embeddings are optional and advertised through
/// [`LlmProvider::supports_embedding`]. Concrete backends live in the
/// foundation crate; tests plug in scripted implementations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, used in logs and error messages.
    fn name(&self) -> &str;

    /// Whether multimodal (image) user content is accepted.
    fn supports_vision(&self) -> bool {
        false
    }

    /// Whether [`LlmProvider::embedding`] is implemented.
    fn supports_embedding(&self) -> bool {
        false
    }

    /// Chat request.
    async fn chat(&self, request: ChatCompletionRequest) -> EngineResult<ChatCompletionResponse>;

    /// Embedding request (default: not supported).
    async fn embedding(&self, _request: EmbeddingRequest) -> EngineResult<EmbeddingResponse> {
        Err(EngineError::Validation(format!(
            "provider {} does not support embeddings",
            self.name()
        )))
    }

    /// Health check.
    async fn health_check(&self) -> EngineResult<bool> {
        Ok(true)
    }
}

/// Shared, dynamically dispatched provider handle.
pub type DynLlmProvider = Arc<dyn LlmProvider>;
