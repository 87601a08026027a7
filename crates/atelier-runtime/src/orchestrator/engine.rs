//! The iteration orchestrator.
//!
//! `execute_request` is the worker entry point. It rebuilds all in-memory
//! state from the persisted request, then drives optimize → generate →
//! evaluate → commit iterations until a terminal condition holds. The
//! request row is the single source of truth; a crash before an iteration
//! commit loses that iteration and at-least-once redelivery retries it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use atelier_kernel::cancel::CancellationRegistry;
use atelier_kernel::config::EngineConfig;
use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::events::{EventBus, EventKind};
use atelier_kernel::judge::{IterationContext, JudgeAgent, Severity};
use atelier_kernel::pricing::PricingRegistry;
use atelier_kernel::request::{
    CompletionReason, CostTracker, EvaluationRecord, GeneratedImage, GenerationRequest,
    IterationMode, IterationSnapshot, RequestStatus,
};

use atelier_foundation::generator::{DynImageGenerator, EditOptions, GenerateOptions, ImageData};
use atelier_foundation::judge::{rank_images, JudgeEvaluator};
use atelier_foundation::llm::vision;
use atelier_foundation::optimizer::{
    recompute_negative_prompts, EditInput, JudgeFeedback, OptimizeInput, PromptOptimizer,
};
use atelier_foundation::persistence::{DynPersistence, ImageStore, JudgeStore, RequestStore};
use atelier_foundation::rag::RagIndex;
use atelier_foundation::storage::{image_key, DynObjectStore};

use super::strategy::{is_plateaued, select_strategy, Strategy, StrategyInputs};
use crate::retry::{retry_with_policy, RetryConfig};

/// Wall-clock budget for one `execute_request` run.
pub const RUN_DEADLINE: Duration = Duration::from_secs(600);

/// Everything the orchestrator operates on.
pub struct OrchestratorContext {
    pub store: DynPersistence,
    pub objects: DynObjectStore,
    pub generator: DynImageGenerator,
    pub evaluator: Arc<JudgeEvaluator>,
    pub optimizer: Arc<PromptOptimizer>,
    pub rag: Arc<RagIndex>,
    pub bus: EventBus,
    pub cancel: CancellationRegistry,
    pub pricing: PricingRegistry,
    pub config: EngineConfig,
}

/// Drives requests from PENDING to a terminal status.
pub struct Orchestrator {
    ctx: OrchestratorContext,
    retry: RetryConfig,
    deadline: Duration,
}

/// Highest aggregate observed so far; later iterations win ties.
#[derive(Debug, Clone, Copy)]
struct Best {
    score: f64,
    image_id: Uuid,
    iteration: u32,
}

/// In-memory run state, rebuilt from the request row on every dispatch.
struct RunState {
    costs: CostTracker,
    negative_prompts: String,
    scores: Vec<f64>,
    previous_prompts: Vec<String>,
    /// Prompt of the most recent regeneration; the edit-failure fallback
    /// regenerates with it.
    current_prompt: Option<String>,
    last_snapshot: Option<IterationSnapshot>,
    best: Option<Best>,
    consecutive_edits: u32,
    retries: u64,
    started: Instant,
}

impl RunState {
    fn seed(request: &GenerationRequest) -> Self {
        let mut best: Option<Best> = None;
        for snapshot in &request.iterations {
            if let Some(image_id) = snapshot.selected_image_id {
                let replace = best
                    .map(|b| snapshot.aggregate_score >= b.score)
                    .unwrap_or(true);
                if replace {
                    best = Some(Best {
                        score: snapshot.aggregate_score,
                        image_id,
                        iteration: snapshot.iteration_number,
                    });
                }
            }
        }
        Self {
            costs: request.costs.clone(),
            negative_prompts: request.negative_prompts.clone(),
            scores: request.iteration_scores(),
            previous_prompts: request
                .iterations
                .iter()
                .filter(|s| s.mode == IterationMode::Regeneration)
                .map(|s| s.optimized_prompt.clone())
                .collect(),
            current_prompt: request
                .iterations
                .iter()
                .rev()
                .find(|s| s.mode == IterationMode::Regeneration)
                .map(|s| s.optimized_prompt.clone()),
            last_snapshot: request.last_iteration().cloned(),
            best,
            consecutive_edits: request
                .last_iteration()
                .map(|s| s.consecutive_edit_count)
                .unwrap_or(0),
            retries: 0,
            started: Instant::now(),
        }
    }

    fn observe(&mut self, snapshot: &IterationSnapshot) {
        self.scores.push(snapshot.aggregate_score);
        if let Some(image_id) = snapshot.selected_image_id {
            let replace = self
                .best
                .map(|b| snapshot.aggregate_score >= b.score)
                .unwrap_or(true);
            if replace {
                self.best = Some(Best {
                    score: snapshot.aggregate_score,
                    image_id,
                    iteration: snapshot.iteration_number,
                });
            }
        }
        self.consecutive_edits = snapshot.consecutive_edit_count;
        self.last_snapshot = Some(snapshot.clone());
    }
}

/// How a run ended.
enum Terminal {
    Completed {
        reason: CompletionReason,
        final_image_id: Uuid,
        best_score: f64,
    },
    Cancelled,
    /// Deadline elapsed before any iteration committed.
    TimedOut,
}

/// What one iteration sent to the image backend.
struct IterationPlan {
    mode: IterationMode,
    /// Prompt or edit instruction, verbatim.
    sent_text: String,
    edit_source_image_id: Option<Uuid>,
    consecutive_edit_count: u32,
    images: Vec<ImageData>,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx,
            retry: RetryConfig::default(),
            deadline: RUN_DEADLINE,
        }
    }

    /// Override the retry discipline (tests use immediate retries).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the wall-clock budget.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    /// Worker entry point. Returns `Ok(())` once the request reached a
    /// terminal status (including FAILED); an error means the terminal
    /// state itself could not be persisted and the job should be retried.
    pub async fn execute_request(&self, request_id: Uuid) -> EngineResult<()> {
        let request = self
            .ctx
            .store
            .get_request(request_id)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .ok_or_else(|| EngineError::Validation(format!("request {request_id} not found")))?;

        if request.is_terminal() {
            info!(%request_id, status = ?request.status, "request already terminal, acking stale dispatch");
            return Ok(());
        }

        if let Err(message) = request.validate() {
            return self.fail(&request, message, None).await;
        }

        let judges = self.load_panel(&request).await?;
        if judges.is_empty() {
            return self
                .fail(
                    &request,
                    "no usable judges: every configured judge is missing or has judging disabled"
                        .to_string(),
                    None,
                )
                .await;
        }

        let mut state = RunState::seed(&request);
        info!(
            %request_id,
            start_iteration = request.next_iteration(),
            max_iterations = request.max_iterations,
            judges = judges.len(),
            "starting refinement run"
        );

        match self.run(&request, &judges, &mut state).await {
            Ok(Terminal::Completed {
                reason,
                final_image_id,
                best_score,
            }) => {
                self.complete(&request, reason, final_image_id, best_score, &state)
                    .await
            }
            Ok(Terminal::Cancelled) | Err(EngineError::Cancelled) => {
                self.finish_cancelled(&request, &state).await
            }
            Ok(Terminal::TimedOut) => {
                let message = format!(
                    "run timed out after {}s before any iteration completed",
                    self.deadline.as_secs()
                );
                self.fail(&request, message, Some(&state)).await
            }
            Err(e) => self.fail(&request, e.to_string(), Some(&state)).await,
        }
    }

    /// Load the panel, dropping judges that cannot judge.
    async fn load_panel(&self, request: &GenerationRequest) -> EngineResult<Vec<JudgeAgent>> {
        let loaded = self
            .ctx
            .store
            .get_judges(&request.judge_ids)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let total = loaded.len();
        let judges: Vec<JudgeAgent> = loaded.into_iter().filter(|j| j.can_judge).collect();
        if judges.len() < total {
            warn!(
                request_id = %request.id,
                dropped = total - judges.len(),
                "dropping judges with judging disabled"
            );
        }
        Ok(judges)
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        judges: &[JudgeAgent],
        state: &mut RunState,
    ) -> EngineResult<Terminal> {
        let start_iteration = request.next_iteration();

        for iteration in start_iteration..=request.max_iterations {
            if self.ctx.cancel.is_cancelled(request.id) {
                return Ok(Terminal::Cancelled);
            }
            if let Some(terminal) = self.deadline_terminal(state) {
                return Ok(terminal);
            }

            let snapshot = self
                .run_iteration(request, judges, state, iteration, start_iteration)
                .await?;
            let aggregate = snapshot.aggregate_score;
            let winner = snapshot.selected_image_id;
            state.observe(&snapshot);

            // Termination checks, in order: threshold, plateau, budget,
            // cancellation, wall clock.
            if aggregate >= request.threshold {
                let final_image_id = winner.ok_or_else(|| {
                    EngineError::Internal("winning iteration has no selected image".into())
                })?;
                return Ok(Terminal::Completed {
                    reason: CompletionReason::Success,
                    final_image_id,
                    best_score: aggregate,
                });
            }

            if is_plateaued(
                &state.scores,
                request.image_params.plateau_window_size,
                request.image_params.plateau_threshold,
            ) {
                if let Some(best) = state.best {
                    info!(
                        request_id = %request.id,
                        window = request.image_params.plateau_window_size,
                        "scores plateaued, stopping with diminishing returns"
                    );
                    return Ok(Terminal::Completed {
                        reason: CompletionReason::DiminishingReturns,
                        final_image_id: best.image_id,
                        best_score: best.score,
                    });
                }
            }

            if iteration == request.max_iterations {
                let best = state.best.ok_or_else(|| {
                    EngineError::Internal("iteration budget exhausted with no best image".into())
                })?;
                return Ok(Terminal::Completed {
                    reason: CompletionReason::MaxRetriesReached,
                    final_image_id: best.image_id,
                    best_score: best.score,
                });
            }

            if self.ctx.cancel.is_cancelled(request.id) {
                return Ok(Terminal::Cancelled);
            }
            if let Some(terminal) = self.deadline_terminal(state) {
                return Ok(terminal);
            }
        }

        // The loop always returns through a termination check; reaching
        // here means the budget was already spent before this run.
        match state.best {
            Some(best) => Ok(Terminal::Completed {
                reason: CompletionReason::MaxRetriesReached,
                final_image_id: best.image_id,
                best_score: best.score,
            }),
            None => Err(EngineError::Validation(
                "request has no iteration budget remaining".into(),
            )),
        }
    }

    /// One full iteration: the three phases plus the ordered commit.
    async fn run_iteration(
        &self,
        request: &GenerationRequest,
        judges: &[JudgeAgent],
        state: &mut RunState,
        iteration: u32,
        start_iteration: u32,
    ) -> EngineResult<IterationSnapshot> {
        let request_id = request.id;

        // Phase 1: OPTIMIZING - pick a strategy and produce the text to send.
        self.set_status(request_id, RequestStatus::Optimizing).await?;
        let strategy = select_strategy(&StrategyInputs {
            mode: request.generation_mode,
            iteration,
            last_score: state.scores.last().copied(),
            last_top_severity: state
                .last_snapshot
                .as_ref()
                .and_then(|s| most_severe(&s.evaluations)),
            consecutive_edit_count: state.consecutive_edits,
            scores: state.scores.clone(),
        });
        info!(%request_id, iteration, ?strategy, "iteration planned");

        // Phase 2: GENERATING.
        let plan = match strategy {
            Strategy::Regenerate => {
                self.regenerate(request, judges, state, iteration, start_iteration)
                    .await?
            }
            Strategy::Edit => match self.edit(request, state, iteration).await {
                Ok(plan) => plan,
                Err(e) if !matches!(e, EngineError::Cancelled) => {
                    warn!(%request_id, iteration, error = %e, "edit path failed, falling back to regeneration");
                    state.consecutive_edits = 0;
                    self.regenerate_fallback(request, state).await?
                }
                Err(e) => return Err(e),
            },
        };

        if self.ctx.cancel.is_cancelled(request_id) {
            return Err(EngineError::Cancelled);
        }

        // Phase 3: EVALUATING - upload and judge every candidate in parallel.
        self.set_status(request_id, RequestStatus::Evaluating).await?;
        let (images, upload_retries) = self
            .upload_images(request, iteration, &plan)
            .await?;
        state.retries += upload_retries;

        let context = IterationContext {
            iteration,
            max_iterations: request.max_iterations,
            previous_scores: state.scores.clone(),
        };
        let panels = join_all(images.iter().map(|image| {
            self.ctx
                .evaluator
                .evaluate_with_all_judges(judges, image, &request.brief, Some(&context))
        }))
        .await;

        let mut evaluated: Vec<(Uuid, Vec<EvaluationRecord>)> = Vec::with_capacity(images.len());
        for (image, panel) in images.iter().zip(panels) {
            state.costs.add_llm_tokens(
                panel.llm_tokens,
                self.ctx.pricing.estimate_chat(
                    &self.ctx.config.model_flash,
                    panel.llm_tokens as u32,
                    0,
                ),
            );
            state.costs.add_embedding_tokens(
                panel.embedding_tokens,
                self.ctx.pricing.estimate_embedding(panel.embedding_tokens),
            );
            evaluated.push((image.id, panel.records));
        }

        let (selected_image_id, aggregate, winner_records) = rank_images(&evaluated)
            .map(|(id, score, records)| (id, score, records.to_vec()))
            .ok_or_else(|| {
                EngineError::AggregationEmpty(format!(
                    "no judge produced a usable evaluation for any of {} images",
                    images.len()
                ))
            })?;

        // Ordered commit: images, costs, snapshot (transactional), event,
        // negatives, and only then the caller's termination checks.
        self.ctx
            .store
            .save_images(&images)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        state.costs.add_image_generations(
            images.len() as u64,
            self.ctx.pricing.estimate_images(images.len() as u64),
        );
        self.ctx
            .store
            .update_costs(request_id, &state.costs)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        let snapshot = IterationSnapshot {
            iteration_number: iteration,
            optimized_prompt: plan.sent_text.clone(),
            mode: plan.mode,
            edit_source_image_id: plan.edit_source_image_id,
            consecutive_edit_count: plan.consecutive_edit_count,
            selected_image_id: Some(selected_image_id),
            aggregate_score: aggregate,
            evaluations: winner_records,
            created_at: Utc::now(),
        };
        self.ctx
            .store
            .append_iteration(request_id, snapshot.clone())
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        self.ctx.bus.emit(
            request_id,
            EventKind::IterationComplete,
            json!({
                "iteration": iteration,
                "aggregateScore": aggregate,
                "selectedImageId": selected_image_id,
                "mode": snapshot.mode,
                "imageCount": images.len(),
            }),
        );

        if let Some(updated) =
            recompute_negative_prompts(&state.negative_prompts, &snapshot.evaluations)
        {
            self.ctx
                .store
                .update_negative_prompts(request_id, updated.clone())
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            state.negative_prompts = updated;
        }

        Ok(snapshot)
    }

    /// Regenerate path: RAG context + prior feedback into a fresh prompt,
    /// then one batched generation call.
    async fn regenerate(
        &self,
        request: &GenerationRequest,
        judges: &[JudgeAgent],
        state: &mut RunState,
        iteration: u32,
        start_iteration: u32,
    ) -> EngineResult<IterationPlan> {
        let prompt = if iteration == start_iteration && request.initial_prompt.is_some() {
            // The caller supplied the opening prompt; use it verbatim.
            request.initial_prompt.clone().unwrap_or_default()
        } else {
            let rag_context = self.collect_rag_context(judges, &request.brief, state).await;
            let feedback = state
                .last_snapshot
                .as_ref()
                .map(|s| judge_feedback(&s.evaluations))
                .unwrap_or_default();

            let input = OptimizeInput {
                brief: request.brief.clone(),
                current_prompt: state.current_prompt.clone(),
                feedback,
                previous_prompts: state.previous_prompts.clone(),
                negative_prompts: (!state.negative_prompts.is_empty())
                    .then(|| state.negative_prompts.clone()),
                rag_context,
                has_reference_images: !request.reference_image_urls.is_empty(),
            };
            let optimized = self.ctx.optimizer.optimize_prompt(&input).await?;
            state.costs.add_llm_tokens(
                optimized.llm_tokens,
                self.ctx.pricing.estimate_chat(
                    &self.ctx.config.model_pro,
                    optimized.llm_tokens as u32,
                    0,
                ),
            );
            optimized.prompt
        };

        self.set_status(request.id, RequestStatus::Generating).await?;
        let opts = GenerateOptions {
            aspect_ratio: request.image_params.aspect_ratio.clone(),
            quality: request.image_params.quality.clone(),
            reference_image_urls: request.reference_image_urls.clone(),
        };
        let count = request.image_params.images_per_generation;
        let generated = retry_with_policy(&self.retry, || {
            self.ctx.generator.generate(&prompt, count, &opts)
        })
        .await?;
        state.retries += generated.retries;

        state.current_prompt = Some(prompt.clone());
        state.previous_prompts.push(prompt.clone());

        Ok(IterationPlan {
            mode: IterationMode::Regeneration,
            sent_text: prompt,
            edit_source_image_id: None,
            consecutive_edit_count: 0,
            images: generated.value,
        })
    }

    /// Edit-failure fallback: regenerate with the previously current prompt.
    async fn regenerate_fallback(
        &self,
        request: &GenerationRequest,
        state: &mut RunState,
    ) -> EngineResult<IterationPlan> {
        let prompt = state
            .current_prompt
            .clone()
            .unwrap_or_else(|| request.brief.clone());

        self.set_status(request.id, RequestStatus::Generating).await?;
        let opts = GenerateOptions {
            aspect_ratio: request.image_params.aspect_ratio.clone(),
            quality: request.image_params.quality.clone(),
            reference_image_urls: request.reference_image_urls.clone(),
        };
        let count = request.image_params.images_per_generation;
        let generated = retry_with_policy(&self.retry, || {
            self.ctx.generator.generate(&prompt, count, &opts)
        })
        .await?;
        state.retries += generated.retries;

        Ok(IterationPlan {
            mode: IterationMode::Regeneration,
            sent_text: prompt,
            edit_source_image_id: None,
            consecutive_edit_count: 0,
            images: generated.value,
        })
    }

    /// Edit path: fetch the prior winner's bytes and an edit instruction in
    /// parallel, then run the edit backend.
    async fn edit(
        &self,
        request: &GenerationRequest,
        state: &mut RunState,
        _iteration: u32,
    ) -> EngineResult<IterationPlan> {
        let last = state
            .last_snapshot
            .as_ref()
            .ok_or_else(|| EngineError::validation("edit strategy with no prior iteration"))?;
        let source_image_id = last
            .selected_image_id
            .ok_or_else(|| EngineError::validation("prior iteration selected no image"))?;
        let source = self
            .ctx
            .store
            .get_image(source_image_id)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Persistence(format!("source image {source_image_id} missing"))
            })?;

        let edit_input = EditInput {
            brief: request.brief.clone(),
            top_issues: last
                .evaluations
                .iter()
                .filter_map(|r| r.top_issue.clone().map(|i| (i, r.weight)))
                .collect(),
            what_worked: last
                .evaluations
                .iter()
                .flat_map(|r| r.what_worked.clone().unwrap_or_default())
                .collect(),
        };

        let (bytes, instruction) = tokio::join!(
            async {
                let fetched = retry_with_policy(&self.retry, || {
                    self.ctx.objects.get(&source.storage_key)
                })
                .await?;
                Ok::<_, EngineError>(fetched)
            },
            self.ctx.optimizer.build_edit_instruction(&edit_input)
        );
        let fetched = bytes?;
        state.retries += fetched.retries;
        let instruction = instruction?;
        state.costs.add_llm_tokens(
            instruction.llm_tokens,
            self.ctx.pricing.estimate_chat(
                &self.ctx.config.model_pro,
                instruction.llm_tokens as u32,
                0,
            ),
        );

        let source_base64 = vision::encode_base64(&fetched.value);

        self.set_status(request.id, RequestStatus::Generating).await?;
        let opts = EditOptions {
            aspect_ratio: request.image_params.aspect_ratio.clone(),
        };
        let count = request.image_params.images_per_generation;
        let edited = retry_with_policy(&self.retry, || {
            self.ctx
                .generator
                .edit(&source_base64, &instruction.instruction, count, &opts)
        })
        .await?;
        state.retries += edited.retries;

        Ok(IterationPlan {
            mode: IterationMode::Edit,
            sent_text: instruction.instruction,
            edit_source_image_id: Some(source_image_id),
            consecutive_edit_count: state.consecutive_edits + 1,
            images: edited.value,
        })
    }

    /// Upload every candidate in parallel with wait-all-settled fan-in.
    async fn upload_images(
        &self,
        request: &GenerationRequest,
        iteration: u32,
        plan: &IterationPlan,
    ) -> EngineResult<(Vec<GeneratedImage>, u64)> {
        let uploads = plan.images.iter().map(|data| {
            self.upload_one(request, iteration, &plan.sent_text, data)
        });
        let settled: Vec<EngineResult<(GeneratedImage, u64)>> = join_all(uploads).await;

        // Every upload has settled; only now propagate the first failure so
        // no in-flight work is orphaned.
        let mut images = Vec::with_capacity(settled.len());
        let mut first_error = None;
        let mut retries = 0u64;
        for result in settled {
            match result {
                Ok((image, r)) => {
                    retries += r;
                    images.push(image);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok((images, retries))
    }

    async fn upload_one(
        &self,
        request: &GenerationRequest,
        iteration: u32,
        prompt_used: &str,
        data: &ImageData,
    ) -> EngineResult<(GeneratedImage, u64)> {
        let image_id = Uuid::new_v4();
        let key = image_key(request.organization_id, request.id, image_id);
        let uploaded = retry_with_policy(&self.retry, || {
            self.ctx.objects.put(&key, &data.mime_type, data.bytes.clone())
        })
        .await?;

        Ok((
            GeneratedImage {
                id: image_id,
                request_id: request.id,
                iteration_number: iteration,
                public_url: self.ctx.objects.public_url(&key),
                storage_key: key,
                prompt_used: prompt_used.to_string(),
                mime_type: data.mime_type.clone(),
                file_size_bytes: data.bytes.len() as u64,
                created_at: Utc::now(),
            },
            uploaded.retries,
        ))
    }

    /// Per-judge retrieval over the brief for the optimizer. Best-effort:
    /// failures skip that judge's context.
    async fn collect_rag_context(
        &self,
        judges: &[JudgeAgent],
        brief: &str,
        state: &mut RunState,
    ) -> Vec<String> {
        let mut context = Vec::new();
        for judge in judges {
            match self.ctx.rag.retrieve(judge, brief).await {
                Ok(retrieval) => {
                    state.costs.add_embedding_tokens(
                        retrieval.embedding_tokens,
                        self.ctx
                            .pricing
                            .estimate_embedding(retrieval.embedding_tokens),
                    );
                    context.extend(retrieval.chunks.into_iter().map(|c| c.content));
                }
                Err(e) => {
                    warn!(judge = %judge.name, error = %e, "optimizer rag retrieval failed, skipping");
                }
            }
        }
        context
    }

    fn deadline_terminal(&self, state: &RunState) -> Option<Terminal> {
        if state.started.elapsed() < self.deadline {
            return None;
        }
        match state.best {
            // Budget elapsed mid-run: keep the best committed result.
            Some(best) if !state.scores.is_empty() => Some(Terminal::Completed {
                reason: CompletionReason::MaxRetriesReached,
                final_image_id: best.image_id,
                best_score: best.score,
            }),
            _ => Some(Terminal::TimedOut),
        }
    }

    async fn set_status(&self, request_id: Uuid, status: RequestStatus) -> EngineResult<()> {
        self.ctx
            .store
            .update_status(request_id, status)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.ctx.bus.emit(
            request_id,
            EventKind::StatusChange,
            json!({ "status": status }),
        );
        Ok(())
    }

    async fn complete(
        &self,
        request: &GenerationRequest,
        reason: CompletionReason,
        final_image_id: Uuid,
        best_score: f64,
        state: &RunState,
    ) -> EngineResult<()> {
        self.ctx
            .store
            .finish_request(
                request.id,
                RequestStatus::Completed,
                Some(reason),
                Some(final_image_id),
                None,
                Utc::now(),
            )
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.ctx.cancel.clear(request.id);

        info!(request_id = %request.id, ?reason, best_score, "request completed");
        self.ctx.bus.emit(
            request.id,
            EventKind::Completed,
            self.summary(request, RequestStatus::Completed, Some(reason), Some(final_image_id), best_score, None, state),
        );
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        request: &GenerationRequest,
        state: &RunState,
    ) -> EngineResult<()> {
        self.ctx
            .store
            .finish_request(
                request.id,
                RequestStatus::Cancelled,
                Some(CompletionReason::Cancelled),
                None,
                None,
                Utc::now(),
            )
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.ctx.cancel.clear(request.id);

        info!(request_id = %request.id, "request cancelled");
        let best_score = state.best.map(|b| b.score).unwrap_or(0.0);
        self.ctx.bus.emit(
            request.id,
            EventKind::Completed,
            self.summary(
                request,
                RequestStatus::Cancelled,
                Some(CompletionReason::Cancelled),
                None,
                best_score,
                None,
                state,
            ),
        );
        Ok(())
    }

    async fn fail(
        &self,
        request: &GenerationRequest,
        message: String,
        state: Option<&RunState>,
    ) -> EngineResult<()> {
        self.ctx
            .store
            .finish_request(
                request.id,
                RequestStatus::Failed,
                Some(CompletionReason::Error),
                None,
                Some(message.clone()),
                Utc::now(),
            )
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        self.ctx.cancel.clear(request.id);

        warn!(request_id = %request.id, %message, "request failed");
        let empty = RunState::seed(request);
        let state = state.unwrap_or(&empty);
        let best_score = state.best.map(|b| b.score).unwrap_or(0.0);
        self.ctx.bus.emit(
            request.id,
            EventKind::Failed,
            self.summary(
                request,
                RequestStatus::Failed,
                Some(CompletionReason::Error),
                None,
                best_score,
                Some(message),
                state,
            ),
        );
        Ok(())
    }

    /// Terminal summary payload; cost and retry counters are always
    /// included regardless of the terminal kind.
    fn summary(
        &self,
        request: &GenerationRequest,
        status: RequestStatus,
        reason: Option<CompletionReason>,
        final_image_id: Option<Uuid>,
        best_score: f64,
        error: Option<String>,
        state: &RunState,
    ) -> serde_json::Value {
        json!({
            "status": status,
            "completionReason": reason,
            "finalImageId": final_image_id,
            "bestScore": best_score,
            "iterations": state.scores.len(),
            "costs": state.costs,
            "retries": state.retries,
            "error": error,
        })
    }
}

/// Most severe top issue across a winner's evaluations.
fn most_severe(records: &[EvaluationRecord]) -> Option<Severity> {
    records
        .iter()
        .filter_map(EvaluationRecord::top_severity)
        .min_by_key(|s| s.rank())
}

/// Distill evaluation records into optimizer feedback.
fn judge_feedback(records: &[EvaluationRecord]) -> Vec<JudgeFeedback> {
    records
        .iter()
        .map(|r| JudgeFeedback {
            agent_name: r.agent_name.clone(),
            weight: r.weight,
            feedback: r.feedback.clone(),
            top_issue: r.top_issue.clone(),
            what_worked: r.what_worked.clone().unwrap_or_default(),
            prompt_instructions: r.prompt_instructions.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(severity: Severity) -> EvaluationRecord {
        EvaluationRecord {
            agent_id: Uuid::new_v4(),
            agent_name: "j".into(),
            image_id: Uuid::new_v4(),
            overall_score: 60.0,
            weight: 50.0,
            feedback: String::new(),
            category_scores: None,
            top_issue: Some(atelier_kernel::judge::TopIssue {
                problem: "p".into(),
                severity,
                fix: "f".into(),
            }),
            what_worked: None,
            checklist: None,
            prompt_instructions: None,
        }
    }

    #[test]
    fn most_severe_picks_the_worst() {
        let records = vec![record(Severity::Minor), record(Severity::Major)];
        assert_eq!(most_severe(&records), Some(Severity::Major));
        assert_eq!(most_severe(&[]), None);
    }

    #[test]
    fn judge_feedback_carries_instructions() {
        let mut r = record(Severity::Minor);
        r.prompt_instructions = Some(vec!["keep the vignette".into()]);
        r.what_worked = Some(vec!["framing".into()]);
        let feedback = judge_feedback(&[r]);
        assert_eq!(feedback[0].prompt_instructions, vec!["keep the vignette"]);
        assert_eq!(feedback[0].what_worked, vec!["framing"]);
    }
}
