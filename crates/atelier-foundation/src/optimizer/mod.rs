//! Prompt optimizer.
//!
//! Turns accumulated judge feedback into either the next full generation
//! prompt or a bounded edit instruction. The optimizer's settings are a
//! process-wide singleton: loaded (or created) on first use and cached
//! behind an invalidate-on-write lock.

pub mod negative;
pub mod sections;

pub use negative::recompute_negative_prompts;
pub use sections::{
    build_edit_message, build_optimize_message, dedupe_issues, order_issues, EditInput,
    JudgeFeedback, OptimizeInput, EDIT_SUFFIX, MAX_EDIT_ISSUES,
};

use std::sync::Arc;

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::llm::{ChatCompletionRequest, DynLlmProvider};
use atelier_kernel::request::OptimizerSettings;
use tokio::sync::RwLock;

use crate::persistence::OptimizerStore;

/// Edit-instruction sampling temperature.
const EDIT_TEMPERATURE: f32 = 0.3;

/// System prompt installed when no optimizer settings exist yet.
pub const DEFAULT_OPTIMIZER_SYSTEM_PROMPT: &str = "You are a prompt engineer for an image \
generation model. You rewrite prompts between iterations: every critical issue the judges \
raised must be addressed, every element that worked must be preserved, and verbatim judge \
instructions must appear unchanged. You write dense, concrete, visual language and never \
mention the judging process in the prompt itself.";

/// Result of an optimize call.
#[derive(Debug, Clone)]
pub struct OptimizedPrompt {
    pub prompt: String,
    pub llm_tokens: u64,
}

/// Result of an edit-instruction call.
#[derive(Debug, Clone)]
pub struct EditInstruction {
    pub instruction: String,
    pub llm_tokens: u64,
}

/// The process-wide prompt optimizer.
pub struct PromptOptimizer {
    provider: DynLlmProvider,
    store: Arc<dyn OptimizerStore>,
    default_model: String,
    cache: RwLock<Option<Arc<OptimizerSettings>>>,
}

impl PromptOptimizer {
    pub fn new(
        provider: DynLlmProvider,
        store: Arc<dyn OptimizerStore>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            default_model: default_model.into(),
            cache: RwLock::new(None),
        }
    }

    /// Current settings, lazily created on first use.
    pub async fn settings(&self) -> EngineResult<Arc<OptimizerSettings>> {
        if let Some(settings) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(settings));
        }

        let mut cache = self.cache.write().await;
        // Another task may have filled the cache while we waited.
        if let Some(settings) = cache.as_ref() {
            return Ok(Arc::clone(settings));
        }

        let settings = match self
            .store
            .load_optimizer()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
        {
            Some(existing) => existing,
            None => {
                let defaults = self.default_settings();
                self.store
                    .save_optimizer(&defaults)
                    .await
                    .map_err(|e| EngineError::Persistence(e.to_string()))?;
                defaults
            }
        };

        let settings = Arc::new(settings);
        *cache = Some(Arc::clone(&settings));
        Ok(settings)
    }

    /// Persist new settings and invalidate the cache.
    pub async fn update_settings(&self, settings: OptimizerSettings) -> EngineResult<()> {
        self.store
            .save_optimizer(&settings)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        *self.cache.write().await = None;
        Ok(())
    }

    fn default_settings(&self) -> OptimizerSettings {
        OptimizerSettings {
            system_prompt: DEFAULT_OPTIMIZER_SYSTEM_PROMPT.to_string(),
            model: self.default_model.clone(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    /// Compose and run the optimize-prompt call; returns the next prompt.
    pub async fn optimize_prompt(&self, input: &OptimizeInput) -> EngineResult<OptimizedPrompt> {
        let settings = self.settings().await?;
        let message = build_optimize_message(input);

        let request = ChatCompletionRequest::new(settings.model.clone())
            .system(settings.system_prompt.clone())
            .user(message)
            .temperature(settings.temperature)
            .max_tokens(settings.max_tokens);

        let response = self.provider.chat(request).await?;
        let llm_tokens = response.total_tokens();
        let prompt = response
            .content()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::Backend("optimizer returned an empty prompt".into()))?
            .to_string();

        Ok(OptimizedPrompt { prompt, llm_tokens })
    }

    /// Build a numbered edit instruction from the worst issues.
    ///
    /// Up to five issues are applied, severity-sorted and deduped by
    /// problem-text prefix. The instruction always ends with the exact
    /// preserve-everything-else sentence.
    pub async fn build_edit_instruction(&self, input: &EditInput) -> EngineResult<EditInstruction> {
        let settings = self.settings().await?;

        let mut issues = dedupe_issues(order_issues(&input.top_issues));
        issues.truncate(MAX_EDIT_ISSUES);
        if issues.is_empty() {
            return Err(EngineError::validation(
                "cannot build an edit instruction without top issues",
            ));
        }

        let message = build_edit_message(input, &issues);
        let request = ChatCompletionRequest::new(settings.model.clone())
            .system(settings.system_prompt.clone())
            .user(message)
            .temperature(EDIT_TEMPERATURE)
            .max_tokens(settings.max_tokens);

        let response = self.provider.chat(request).await?;
        let llm_tokens = response.total_tokens();
        let mut instruction = response
            .content()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::Backend("edit instruction came back empty".into()))?
            .to_string();

        if !instruction.ends_with(EDIT_SUFFIX) {
            instruction = format!("{instruction}\n{EDIT_SUFFIX}");
        }

        Ok(EditInstruction {
            instruction,
            llm_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use async_trait::async_trait;
    use atelier_kernel::judge::{Severity, TopIssue};
    use atelier_kernel::llm::{
        ChatCompletionResponse, ChatMessage, Choice, FinishReason, LlmProvider, Usage,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProvider {
        reply: String,
        calls: AtomicUsize,
    }

    impl EchoProvider {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(
            &self,
            _request: ChatCompletionRequest,
        ) -> EngineResult<ChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatCompletionResponse {
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::assistant(self.reply.clone()),
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: Some(Usage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                }),
            })
        }
    }

    fn optimizer(reply: &str) -> PromptOptimizer {
        PromptOptimizer::new(
            Arc::new(EchoProvider::new(reply)),
            Arc::new(InMemoryStore::new()),
            "gpt-4o",
        )
    }

    #[tokio::test]
    async fn settings_are_created_lazily_and_cached() {
        let opt = optimizer("whatever");
        let first = opt.settings().await.unwrap();
        assert_eq!(first.model, "gpt-4o");
        assert!(first.system_prompt.contains("prompt engineer"));

        let second = opt.settings().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn update_invalidates_the_cache() {
        let opt = optimizer("whatever");
        let original = opt.settings().await.unwrap();

        let mut updated = (*original).clone();
        updated.temperature = 1.3;
        opt.update_settings(updated).await.unwrap();

        let reloaded = opt.settings().await.unwrap();
        assert!((reloaded.temperature - 1.3).abs() < f32::EPSILON);
        assert!(!Arc::ptr_eq(&original, &reloaded));
    }

    #[tokio::test]
    async fn optimize_returns_trimmed_prompt_and_tokens() {
        let opt = optimizer("  A detailed prompt about apples.  ");
        let result = opt
            .optimize_prompt(&OptimizeInput {
                brief: "a red apple".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.prompt, "A detailed prompt about apples.");
        assert_eq!(result.llm_tokens, 150);
    }

    #[tokio::test]
    async fn edit_instruction_gets_the_suffix_appended() {
        let opt = optimizer("1. Brighten the left side.\n2. Fix the logo.");
        let result = opt
            .build_edit_instruction(&EditInput {
                brief: "a red apple".into(),
                top_issues: vec![(
                    TopIssue {
                        problem: "too dark".into(),
                        severity: Severity::Moderate,
                        fix: "brighten".into(),
                    },
                    50.0,
                )],
                what_worked: vec![],
            })
            .await
            .unwrap();
        assert!(result.instruction.ends_with(EDIT_SUFFIX));
    }

    #[tokio::test]
    async fn edit_instruction_requires_issues() {
        let opt = optimizer("anything");
        let err = opt
            .build_edit_instruction(&EditInput {
                brief: "x".into(),
                top_issues: vec![],
                what_worked: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
