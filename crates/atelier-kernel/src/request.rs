//! Generation-request aggregate and its persisted satellites.
//!
//! `GenerationRequest` is the root aggregate and the single source of truth
//! for a refinement run: the worker rebuilds all in-memory state from it on
//! every dispatch. Iteration snapshots are immutable once appended.

use crate::judge::{ChecklistEntry, Severity, TopIssue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Upper bound on reference images per request.
pub const MAX_REFERENCE_IMAGES: usize = 8;

/// Request lifecycle status. Progresses monotonically toward a terminal
/// state except via explicit continuation reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Optimizing,
    Generating,
    Evaluating,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

/// Why a request reached its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionReason {
    Success,
    MaxRetriesReached,
    DiminishingReturns,
    Cancelled,
    Error,
}

/// How new candidates are produced across iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationMode {
    Regeneration,
    Edit,
    Mixed,
}

/// The mode a single iteration actually ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    Regeneration,
    Edit,
}

/// Image-generation parameters of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageParams {
    /// Candidates generated per iteration, in `[1, 8]`.
    pub images_per_generation: u32,
    pub aspect_ratio: String,
    pub quality: String,
    /// Window of trailing scores inspected for a plateau.
    pub plateau_window_size: usize,
    /// Stored as a fraction (default 0.02) but compared against raw score
    /// differences as `max - min < threshold * 100`, matching the observed
    /// behavior of the scoring scale.
    pub plateau_threshold: f64,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            images_per_generation: 1,
            aspect_ratio: "1:1".to_string(),
            quality: "standard".to_string(),
            plateau_window_size: 3,
            plateau_threshold: 0.02,
        }
    }
}

/// Monotone cost accumulator for a request. Values never decrease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTracker {
    pub llm_tokens: u64,
    pub image_generations: u64,
    pub embedding_tokens: u64,
    pub total_estimated_cost: f64,
}

impl CostTracker {
    pub fn add_llm_tokens(&mut self, tokens: u64, estimated_cost: f64) {
        self.llm_tokens += tokens;
        self.total_estimated_cost += estimated_cost.max(0.0);
    }

    pub fn add_embedding_tokens(&mut self, tokens: u64, estimated_cost: f64) {
        self.embedding_tokens += tokens;
        self.total_estimated_cost += estimated_cost.max(0.0);
    }

    pub fn add_image_generations(&mut self, count: u64, estimated_cost: f64) {
        self.image_generations += count;
        self.total_estimated_cost += estimated_cost.max(0.0);
    }
}

/// One judge's scored verdict on the selected image of an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub image_id: Uuid,
    /// In `[0, 100]`.
    pub overall_score: f64,
    /// Copied from the agent at evaluation time.
    pub weight: f64,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_scores: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_issue: Option<TopIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub what_worked: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checklist: Option<BTreeMap<String, ChecklistEntry>>,
    /// Verbatim strings the optimizer splices into the next prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_instructions: Option<Vec<String>>,
}

impl EvaluationRecord {
    /// Severity of this record's top issue, if it carries one.
    pub fn top_severity(&self) -> Option<Severity> {
        self.top_issue.as_ref().map(|issue| issue.severity)
    }
}

/// Immutable snapshot of one completed iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSnapshot {
    /// 1-based; `iterations[i].iteration_number == i + 1` always holds.
    pub iteration_number: u32,
    /// The text actually sent to the image model.
    pub optimized_prompt: String,
    pub mode: IterationMode,
    /// Required iff `mode == Edit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_source_image_id: Option<Uuid>,
    pub consecutive_edit_count: u32,
    /// Winner of this iteration.
    pub selected_image_id: Option<Uuid>,
    pub aggregate_score: f64,
    /// Evaluations of the selected image, in panel order.
    pub evaluations: Vec<EvaluationRecord>,
    pub created_at: DateTime<Utc>,
}

/// A stored candidate image. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: Uuid,
    pub request_id: Uuid,
    pub iteration_number: u32,
    pub storage_key: String,
    pub public_url: String,
    pub prompt_used: String,
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Process-wide prompt-optimizer configuration, lazily created on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub system_prompt: String,
    pub model: String,
    /// In `[0, 2]`.
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Parameter overrides accepted when continuing a terminal request.
#[derive(Debug, Clone, Default)]
pub struct ContinuationOverrides {
    pub judge_ids: Option<Vec<Uuid>>,
    pub initial_prompt: Option<String>,
    pub generation_mode: Option<GenerationMode>,
}

/// Root aggregate of a refinement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub created_by: Uuid,
    /// The user's natural-language description of the desired image.
    pub brief: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    pub reference_image_urls: Vec<String>,
    /// Accumulated `AVOID:` lines fed into the optimizer.
    pub negative_prompts: String,
    pub judge_ids: Vec<Uuid>,
    pub image_params: ImageParams,
    /// Aggregate score that completes the run, in `[0, 100]`.
    pub threshold: f64,
    /// In `[1, 50]`.
    pub max_iterations: u32,
    pub generation_mode: GenerationMode,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    /// Count of committed iterations; equals `iterations.len()` at rest.
    pub current_iteration: u32,
    pub iterations: Vec<IterationSnapshot>,
    pub costs: CostTracker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_image_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl GenerationRequest {
    /// Create a new PENDING request with defaulted parameters.
    pub fn new(
        organization_id: Uuid,
        created_by: Uuid,
        brief: impl Into<String>,
        judge_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            created_by,
            brief: brief.into(),
            initial_prompt: None,
            reference_image_urls: Vec::new(),
            negative_prompts: String::new(),
            judge_ids,
            image_params: ImageParams::default(),
            threshold: 80.0,
            max_iterations: 5,
            generation_mode: GenerationMode::Mixed,
            status: RequestStatus::Pending,
            completion_reason: None,
            current_iteration: 0,
            iterations: Vec::new(),
            costs: CostTracker::default(),
            final_image_id: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            deleted_at: None,
        }
    }

    /// Validate the aggregate's ranges before dispatch.
    pub fn validate(&self) -> Result<(), String> {
        if self.brief.trim().is_empty() {
            return Err("brief must not be empty".into());
        }
        if self.judge_ids.is_empty() {
            return Err("at least one judge is required".into());
        }
        if self.reference_image_urls.len() > MAX_REFERENCE_IMAGES {
            return Err(format!(
                "at most {MAX_REFERENCE_IMAGES} reference images are allowed"
            ));
        }
        if !(1..=8).contains(&self.image_params.images_per_generation) {
            return Err("images_per_generation must be in [1, 8]".into());
        }
        if !(0.0..=100.0).contains(&self.threshold) {
            return Err("threshold must be in [0, 100]".into());
        }
        if !(1..=50).contains(&self.max_iterations) {
            return Err("max_iterations must be in [1, 50]".into());
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The iteration number the next run starts at (1-based).
    pub fn next_iteration(&self) -> u32 {
        self.current_iteration + 1
    }

    /// The last committed snapshot, if any.
    pub fn last_iteration(&self) -> Option<&IterationSnapshot> {
        self.iterations.last()
    }

    /// Aggregate scores of committed iterations, oldest first.
    pub fn iteration_scores(&self) -> Vec<f64> {
        self.iterations.iter().map(|s| s.aggregate_score).collect()
    }

    /// Check the at-rest invariants; used by tests and the in-memory store.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.current_iteration as usize != self.iterations.len() {
            return Err(format!(
                "current_iteration {} != iterations.len() {}",
                self.current_iteration,
                self.iterations.len()
            ));
        }
        for (i, snapshot) in self.iterations.iter().enumerate() {
            if snapshot.iteration_number as usize != i + 1 {
                return Err(format!(
                    "iterations[{i}].iteration_number is {}, expected {}",
                    snapshot.iteration_number,
                    i + 1
                ));
            }
        }
        if self.status == RequestStatus::Completed && self.final_image_id.is_none() {
            return Err("COMPLETED request has no final image".into());
        }
        Ok(())
    }

    /// Reset a terminal request for continuation: status back to PENDING,
    /// the iteration budget extended by `extra_iterations` from the current
    /// position, and optional parameter swaps applied.
    pub fn prepare_continuation(
        &mut self,
        extra_iterations: u32,
        overrides: ContinuationOverrides,
    ) -> Result<(), String> {
        if !self.is_terminal() {
            return Err("only terminal requests can be continued".into());
        }
        let extra = extra_iterations.max(1);
        self.max_iterations = self.current_iteration + extra;
        if let Some(judges) = overrides.judge_ids {
            if judges.is_empty() {
                return Err("continuation judge list must not be empty".into());
            }
            self.judge_ids = judges;
        }
        if let Some(prompt) = overrides.initial_prompt {
            self.initial_prompt = Some(prompt);
        }
        if let Some(mode) = overrides.generation_mode {
            self.generation_mode = mode;
        }
        self.status = RequestStatus::Pending;
        self.completion_reason = None;
        self.final_image_id = None;
        self.error_message = None;
        self.completed_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "A red apple on white background",
            vec![Uuid::new_v4()],
        )
    }

    fn snapshot(n: u32, score: f64) -> IterationSnapshot {
        IterationSnapshot {
            iteration_number: n,
            optimized_prompt: format!("prompt {n}"),
            mode: IterationMode::Regeneration,
            edit_source_image_id: None,
            consecutive_edit_count: 0,
            selected_image_id: Some(Uuid::new_v4()),
            aggregate_score: score,
            evaluations: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn new_request_is_pending_and_valid() {
        let req = request();
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.validate().is_ok());
        assert!(req.check_invariants().is_ok());
    }

    #[test]
    fn validate_rejects_empty_brief_and_panel() {
        let mut req = request();
        req.brief = "   ".into();
        assert!(req.validate().is_err());

        let mut req = request();
        req.judge_ids.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_params() {
        let mut req = request();
        req.image_params.images_per_generation = 9;
        assert!(req.validate().is_err());

        let mut req = request();
        req.max_iterations = 51;
        assert!(req.validate().is_err());

        let mut req = request();
        req.threshold = 100.5;
        assert!(req.validate().is_err());
    }

    #[test]
    fn invariants_catch_iteration_numbering_drift() {
        let mut req = request();
        req.iterations.push(snapshot(1, 40.0));
        req.iterations.push(snapshot(3, 50.0));
        req.current_iteration = 2;
        assert!(req.check_invariants().is_err());

        req.iterations[1].iteration_number = 2;
        assert!(req.check_invariants().is_ok());
    }

    #[test]
    fn completed_without_final_image_violates_invariants() {
        let mut req = request();
        req.status = RequestStatus::Completed;
        assert!(req.check_invariants().is_err());
        req.final_image_id = Some(Uuid::new_v4());
        assert!(req.check_invariants().is_ok());
    }

    #[test]
    fn cost_tracker_is_monotone() {
        let mut costs = CostTracker::default();
        costs.add_llm_tokens(1_000, 0.01);
        costs.add_embedding_tokens(500, 0.0001);
        costs.add_image_generations(4, 0.16);
        assert_eq!(costs.llm_tokens, 1_000);
        assert_eq!(costs.embedding_tokens, 500);
        assert_eq!(costs.image_generations, 4);
        let before = costs.total_estimated_cost;
        // A negative estimate must never reduce the accumulator.
        costs.add_llm_tokens(10, -5.0);
        assert!(costs.total_estimated_cost >= before);
    }

    #[test]
    fn continuation_extends_budget_and_resets_terminal_fields() {
        let mut req = request();
        req.iterations.push(snapshot(1, 70.0));
        req.current_iteration = 1;
        req.status = RequestStatus::Completed;
        req.completion_reason = Some(CompletionReason::Success);
        req.final_image_id = Some(Uuid::new_v4());
        req.completed_at = Some(Utc::now());

        req.prepare_continuation(3, ContinuationOverrides::default())
            .unwrap();

        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.max_iterations, 4);
        assert!(req.completion_reason.is_none());
        assert!(req.final_image_id.is_none());
        assert!(req.completed_at.is_none());
        // Committed history survives the reset.
        assert_eq!(req.current_iteration, 1);
        assert_eq!(req.iterations.len(), 1);
    }

    #[test]
    fn continuation_rejects_non_terminal_requests() {
        let mut req = request();
        let err = req.prepare_continuation(3, ContinuationOverrides::default());
        assert!(err.is_err());
    }

    #[test]
    fn continuation_applies_overrides() {
        let mut req = request();
        req.status = RequestStatus::Failed;
        let new_judges = vec![Uuid::new_v4(), Uuid::new_v4()];
        req.prepare_continuation(
            2,
            ContinuationOverrides {
                judge_ids: Some(new_judges.clone()),
                initial_prompt: Some("start from here".into()),
                generation_mode: Some(GenerationMode::Edit),
            },
        )
        .unwrap();
        assert_eq!(req.judge_ids, new_judges);
        assert_eq!(req.initial_prompt.as_deref(), Some("start from here"));
        assert_eq!(req.generation_mode, GenerationMode::Edit);
    }

    #[test]
    fn status_terminality() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Evaluating.is_terminal());
    }

    #[test]
    fn serde_round_trip_preserves_snapshot_fields() {
        let mut req = request();
        req.iterations.push(snapshot(1, 55.5));
        req.current_iteration = 1;
        let json = serde_json::to_string(&req).unwrap();
        let back: GenerationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iterations.len(), 1);
        assert_eq!(back.iterations[0].iteration_number, 1);
        assert!((back.iterations[0].aggregate_score - 55.5).abs() < f64::EPSILON);
        assert!(json.contains("\"PENDING\""));
        assert!(json.contains("\"regeneration\""));
    }
}
