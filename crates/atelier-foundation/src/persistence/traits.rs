//! Persistence adapter traits.
//!
//! The orchestrator is stateless between dispatches; these traits define
//! exactly the writes it performs, with the iteration commit as the single
//! transactional boundary.

use async_trait::async_trait;
use atelier_kernel::judge::JudgeAgent;
use atelier_kernel::request::{
    CompletionReason, CostTracker, GeneratedImage, GenerationRequest, IterationSnapshot,
    OptimizerSettings, RequestStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Persistence error: {0}")]
    Other(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Store for generation requests and their iteration history.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request row.
    async fn create_request(&self, request: &GenerationRequest) -> PersistenceResult<()>;

    /// Load a request. Soft-deleted rows are not returned.
    async fn get_request(&self, id: Uuid) -> PersistenceResult<Option<GenerationRequest>>;

    /// Replace the full request row (continuation resets, admin edits).
    async fn save_request(&self, request: &GenerationRequest) -> PersistenceResult<()>;

    /// Update only the status column.
    async fn update_status(&self, id: Uuid, status: RequestStatus) -> PersistenceResult<()>;

    /// Transactional iteration commit: append the snapshot and advance
    /// `current_iteration` in one write. The snapshot's number must be
    /// exactly `current_iteration + 1`.
    async fn append_iteration(
        &self,
        id: Uuid,
        snapshot: IterationSnapshot,
    ) -> PersistenceResult<()>;

    /// Replace the cost accumulator. Totals must not decrease.
    async fn update_costs(&self, id: Uuid, costs: &CostTracker) -> PersistenceResult<()>;

    /// Persist the recomputed negative-prompt list.
    async fn update_negative_prompts(&self, id: Uuid, value: String) -> PersistenceResult<()>;

    /// Write the terminal state of a request.
    async fn finish_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        reason: Option<CompletionReason>,
        final_image_id: Option<Uuid>,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> PersistenceResult<()>;
}

/// Store for generated images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save_images(&self, images: &[GeneratedImage]) -> PersistenceResult<()>;

    async fn get_image(&self, id: Uuid) -> PersistenceResult<Option<GeneratedImage>>;

    /// Images of a request, oldest first.
    async fn list_request_images(
        &self,
        request_id: Uuid,
    ) -> PersistenceResult<Vec<GeneratedImage>>;
}

/// Store for judge agents with their documents and chunks.
#[async_trait]
pub trait JudgeStore: Send + Sync {
    /// Load judges by id, preserving the requested order. Unknown ids are
    /// skipped.
    async fn get_judges(&self, ids: &[Uuid]) -> PersistenceResult<Vec<JudgeAgent>>;

    async fn save_judge(&self, judge: &JudgeAgent) -> PersistenceResult<()>;
}

/// Store for the optimizer singleton.
#[async_trait]
pub trait OptimizerStore: Send + Sync {
    async fn load_optimizer(&self) -> PersistenceResult<Option<OptimizerSettings>>;

    async fn save_optimizer(&self, settings: &OptimizerSettings) -> PersistenceResult<()>;
}

/// Full persistence surface the orchestrator depends on.
pub trait PersistenceStore:
    RequestStore + ImageStore + JudgeStore + OptimizerStore
{
    /// Backend name for logs.
    fn backend_name(&self) -> &str;
}

/// Shared, dynamically dispatched store handle.
pub type DynPersistence = Arc<dyn PersistenceStore>;
