//! Panel evaluation of candidate images.

use std::sync::Arc;

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::judge::{IterationContext, JudgeAgent, ModelTier};
use atelier_kernel::llm::{ChatCompletionRequest, ChatMessage, DynLlmProvider};
use atelier_kernel::request::{EvaluationRecord, GeneratedImage};
use futures::future::join_all;
use tracing::warn;
use uuid::Uuid;

use super::parse::parse_evaluation;
use super::prompts::{build_evaluation_prompt, effective_system_prompt};
use crate::rag::RagIndex;

/// Judge-call sampling temperature.
const JUDGE_TEMPERATURE: f32 = 0.3;

/// Model ids backing the two judge tiers.
#[derive(Debug, Clone)]
pub struct TierModels {
    pub pro: String,
    pub flash: String,
}

impl TierModels {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Pro => &self.pro,
            ModelTier::Flash => &self.flash,
        }
    }
}

/// One judge's evaluation plus the tokens it spent.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub record: EvaluationRecord,
    pub llm_tokens: u64,
    pub embedding_tokens: u64,
}

/// Runs the judge panel against candidate images.
pub struct JudgeEvaluator {
    provider: DynLlmProvider,
    rag: Arc<RagIndex>,
    models: TierModels,
}

impl JudgeEvaluator {
    pub fn new(provider: DynLlmProvider, rag: Arc<RagIndex>, models: TierModels) -> Self {
        Self {
            provider,
            rag,
            models,
        }
    }

    /// Evaluate one image with one judge.
    ///
    /// RAG context is best-effort: a retrieval failure downgrades to an
    /// uncontexted evaluation rather than losing the judge's vote. A
    /// response that cannot be parsed surfaces as [`EngineError::JudgeParse`]
    /// and the caller drops this evaluation.
    pub async fn evaluate_image(
        &self,
        agent: &JudgeAgent,
        image: &GeneratedImage,
        brief: &str,
        context: Option<&IterationContext>,
    ) -> EngineResult<EvaluationOutcome> {
        let query = format!("{brief} {}", image.prompt_used);
        let (rag_chunks, embedding_tokens) = match self.rag.retrieve(agent, &query).await {
            Ok(retrieval) => (retrieval.chunks, retrieval.embedding_tokens),
            Err(e) => {
                warn!(judge = %agent.name, error = %e, "rag retrieval failed, evaluating without context");
                (vec![], 0)
            }
        };

        let system = effective_system_prompt(agent);
        let user_text = build_evaluation_prompt(brief, &image.prompt_used, agent, context, &rag_chunks);

        let request = ChatCompletionRequest::new(self.models.model_for(agent.tier()))
            .message(ChatMessage::system(system))
            .message(ChatMessage::user_with_image(user_text, image.public_url.clone()))
            .temperature(JUDGE_TEMPERATURE);

        let response = self.provider.chat(request).await?;
        let llm_tokens = response.total_tokens();
        let content = response
            .content()
            .ok_or_else(|| EngineError::JudgeParse("empty judge response".into()))?;

        let evaluation = parse_evaluation(content)?;

        Ok(EvaluationOutcome {
            record: EvaluationRecord {
                agent_id: agent.id,
                agent_name: agent.name.clone(),
                image_id: image.id,
                overall_score: evaluation.score,
                weight: agent.scoring_weight,
                feedback: evaluation.feedback,
                category_scores: evaluation.category_scores,
                top_issue: evaluation.top_issue,
                what_worked: evaluation.what_worked,
                checklist: evaluation.checklist,
                prompt_instructions: evaluation.prompt_instructions,
            },
            llm_tokens,
            embedding_tokens,
        })
    }

    /// Run the whole panel against one image in parallel.
    ///
    /// Parse failures are dropped with a warning; the image can still be
    /// ranked by the remaining judges. Returns the usable evaluations.
    pub async fn evaluate_with_all_judges(
        &self,
        agents: &[JudgeAgent],
        image: &GeneratedImage,
        brief: &str,
        context: Option<&IterationContext>,
    ) -> PanelOutcome {
        let futures = agents
            .iter()
            .map(|agent| self.evaluate_image(agent, image, brief, context));
        let results = join_all(futures).await;

        let mut outcome = PanelOutcome::default();
        for (agent, result) in agents.iter().zip(results) {
            match result {
                Ok(eval) => {
                    outcome.llm_tokens += eval.llm_tokens;
                    outcome.embedding_tokens += eval.embedding_tokens;
                    outcome.records.push(eval.record);
                }
                Err(EngineError::JudgeParse(reason)) => {
                    warn!(judge = %agent.name, image = %image.id, %reason, "judge response unusable, dropping evaluation");
                    outcome.dropped += 1;
                }
                Err(e) => {
                    warn!(judge = %agent.name, image = %image.id, error = %e, "judge call failed, dropping evaluation");
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }
}

/// Usable evaluations of one image plus panel-level accounting.
#[derive(Debug, Clone, Default)]
pub struct PanelOutcome {
    pub records: Vec<EvaluationRecord>,
    pub dropped: usize,
    pub llm_tokens: u64,
    pub embedding_tokens: u64,
}

/// Weighted mean of the panel's scores. A zero total weight aggregates to
/// exactly 0.
pub fn aggregate_score(records: &[EvaluationRecord]) -> f64 {
    let total_weight: f64 = records.iter().map(|r| r.weight).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    let weighted: f64 = records.iter().map(|r| r.overall_score * r.weight).sum();
    weighted / total_weight
}

/// Pick the winning image from per-image evaluations, given in insertion
/// order. Ties resolve to the later image.
pub fn rank_images(
    evaluated: &[(Uuid, Vec<EvaluationRecord>)],
) -> Option<(Uuid, f64, &[EvaluationRecord])> {
    let mut best: Option<(Uuid, f64, &[EvaluationRecord])> = None;
    for (image_id, records) in evaluated {
        if records.is_empty() {
            continue;
        }
        let score = aggregate_score(records);
        match &best {
            Some((_, best_score, _)) if score < *best_score => {}
            _ => best = Some((*image_id, score, records.as_slice())),
        }
    }
    best
}
