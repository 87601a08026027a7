//! Judge-side domain types.
//!
//! A judge is an agent configured with a scoring rubric and weight that
//! evaluates candidate images against the brief. Judges own their document
//! set; documents own their ordered chunk set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Model tier a judge is pinned to. PRO routes to the high-capability
/// model, FLASH to the low-latency one. Unset defaults to FLASH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTier {
    Pro,
    Flash,
}

/// Retrieval configuration for a judge's document collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Number of chunks to retrieve, clamped to `[1, 20]`.
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to qualify, in `[0, 1]`.
    pub similarity_threshold: f32,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.7,
        }
    }
}

/// One chunk of a judge document, stored with its embedding vector.
///
/// All chunks of a single index share the embedding model's dimension;
/// retrieval fails on a mismatch rather than comparing unlike vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// A document attached to a judge, already chunked and embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDocument {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub filename: String,
    pub chunks: Vec<DocumentChunk>,
}

/// The judge view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeAgent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub system_prompt: String,
    /// Optional override for the scoring instructions. Honored only when it
    /// carries a recognizable OUTPUT FORMAT section.
    pub judge_prompt: Option<String>,
    /// Relative weight in the aggregate, in `[0, 100]`.
    pub scoring_weight: f64,
    pub can_judge: bool,
    pub evaluation_categories: Option<Vec<String>>,
    #[serde(default)]
    pub rag: RagConfig,
    pub model_tier: Option<ModelTier>,
    #[serde(default)]
    pub documents: Vec<AgentDocument>,
}

impl JudgeAgent {
    pub fn tier(&self) -> ModelTier {
        self.model_tier.unwrap_or(ModelTier::Flash)
    }
}

/// Severity of a judge-reported issue, ordered most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Moderate,
    Minor,
}

impl Severity {
    /// Lower rank sorts first (critical before minor).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Major => 1,
            Severity::Moderate => 2,
            Severity::Minor => 3,
        }
    }

    /// Lenient parse used on judge output; unknown strings fall back to
    /// [`Severity::Moderate`].
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "major" => Severity::Major,
            "minor" => Severity::Minor,
            _ => Severity::Moderate,
        }
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, Severity::Critical | Severity::Major)
    }
}

/// The single most impactful flaw a judge identified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopIssue {
    pub problem: String,
    pub severity: Severity,
    pub fix: String,
}

/// One checklist line from a judge response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistEntry {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The parsed body of a single judge response, before it is stamped with
/// agent identity into an `EvaluationRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeEvaluation {
    pub score: f64,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_scores: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_issue: Option<TopIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub what_worked: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checklist: Option<BTreeMap<String, ChecklistEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_instructions: Option<Vec<String>>,
}

/// Prior-iteration context handed to a judge so it scores on absolute
/// merits instead of inflating across iterations.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub iteration: u32,
    pub max_iterations: u32,
    pub previous_scores: Vec<f64>,
}
