//! In-memory persistence backend.
//!
//! The reference implementation of the persistence adapter. Each map sits
//! behind its own lock; the iteration commit mutates the request row under
//! a single write lock, which is what makes it atomic.

use async_trait::async_trait;
use atelier_kernel::judge::JudgeAgent;
use atelier_kernel::request::{
    CompletionReason, CostTracker, GeneratedImage, GenerationRequest, IterationSnapshot,
    OptimizerSettings, RequestStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{
    ImageStore, JudgeStore, OptimizerStore, PersistenceError, PersistenceResult,
    PersistenceStore, RequestStore,
};

/// HashMap-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    requests: RwLock<HashMap<Uuid, GenerationRequest>>,
    images: RwLock<HashMap<Uuid, GeneratedImage>>,
    judges: RwLock<HashMap<Uuid, JudgeAgent>>,
    optimizer: RwLock<Option<OptimizerSettings>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: Uuid) -> PersistenceError {
    PersistenceError::NotFound(format!("request {id}"))
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn create_request(&self, request: &GenerationRequest) -> PersistenceResult<()> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(PersistenceError::Constraint(format!(
                "request {} already exists",
                request.id
            )));
        }
        requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> PersistenceResult<Option<GenerationRequest>> {
        let requests = self.requests.read().await;
        Ok(requests
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn save_request(&self, request: &GenerationRequest) -> PersistenceResult<()> {
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: RequestStatus) -> PersistenceResult<()> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        request.status = status;
        Ok(())
    }

    async fn append_iteration(
        &self,
        id: Uuid,
        snapshot: IterationSnapshot,
    ) -> PersistenceResult<()> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        let expected = request.current_iteration + 1;
        if snapshot.iteration_number != expected {
            return Err(PersistenceError::Constraint(format!(
                "iteration {} does not follow current_iteration {}",
                snapshot.iteration_number, request.current_iteration
            )));
        }
        request.current_iteration = snapshot.iteration_number;
        request.iterations.push(snapshot);
        Ok(())
    }

    async fn update_costs(&self, id: Uuid, costs: &CostTracker) -> PersistenceResult<()> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        if costs.total_estimated_cost < request.costs.total_estimated_cost
            || costs.llm_tokens < request.costs.llm_tokens
            || costs.embedding_tokens < request.costs.embedding_tokens
            || costs.image_generations < request.costs.image_generations
        {
            return Err(PersistenceError::Constraint(
                "cost accumulator must not decrease".into(),
            ));
        }
        request.costs = costs.clone();
        Ok(())
    }

    async fn update_negative_prompts(&self, id: Uuid, value: String) -> PersistenceResult<()> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        request.negative_prompts = value;
        Ok(())
    }

    async fn finish_request(
        &self,
        id: Uuid,
        status: RequestStatus,
        reason: Option<CompletionReason>,
        final_image_id: Option<Uuid>,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        if !status.is_terminal() {
            return Err(PersistenceError::Constraint(format!(
                "finish_request called with non-terminal status {status:?}"
            )));
        }
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&id).ok_or_else(|| not_found(id))?;
        request.status = status;
        request.completion_reason = reason;
        request.final_image_id = final_image_id;
        request.error_message = error_message;
        request.completed_at = Some(completed_at);
        Ok(())
    }
}

#[async_trait]
impl ImageStore for InMemoryStore {
    async fn save_images(&self, images: &[GeneratedImage]) -> PersistenceResult<()> {
        let mut map = self.images.write().await;
        for image in images {
            map.insert(image.id, image.clone());
        }
        Ok(())
    }

    async fn get_image(&self, id: Uuid) -> PersistenceResult<Option<GeneratedImage>> {
        Ok(self.images.read().await.get(&id).cloned())
    }

    async fn list_request_images(
        &self,
        request_id: Uuid,
    ) -> PersistenceResult<Vec<GeneratedImage>> {
        let mut images: Vec<GeneratedImage> = self
            .images
            .read()
            .await
            .values()
            .filter(|i| i.request_id == request_id)
            .cloned()
            .collect();
        images.sort_by_key(|i| (i.iteration_number, i.created_at));
        Ok(images)
    }
}

#[async_trait]
impl JudgeStore for InMemoryStore {
    async fn get_judges(&self, ids: &[Uuid]) -> PersistenceResult<Vec<JudgeAgent>> {
        let judges = self.judges.read().await;
        Ok(ids.iter().filter_map(|id| judges.get(id).cloned()).collect())
    }

    async fn save_judge(&self, judge: &JudgeAgent) -> PersistenceResult<()> {
        self.judges.write().await.insert(judge.id, judge.clone());
        Ok(())
    }
}

#[async_trait]
impl OptimizerStore for InMemoryStore {
    async fn load_optimizer(&self) -> PersistenceResult<Option<OptimizerSettings>> {
        Ok(self.optimizer.read().await.clone())
    }

    async fn save_optimizer(&self, settings: &OptimizerSettings) -> PersistenceResult<()> {
        *self.optimizer.write().await = Some(settings.clone());
        Ok(())
    }
}

impl PersistenceStore for InMemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_kernel::request::IterationMode;

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "A red apple",
            vec![Uuid::new_v4()],
        )
    }

    fn snapshot(n: u32) -> IterationSnapshot {
        IterationSnapshot {
            iteration_number: n,
            optimized_prompt: "p".into(),
            mode: IterationMode::Regeneration,
            edit_source_image_id: None,
            consecutive_edit_count: 0,
            selected_image_id: Some(Uuid::new_v4()),
            aggregate_score: 50.0,
            evaluations: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();
        let loaded = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, req.id);
        assert!(store.get_request(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_a_constraint_violation() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();
        assert!(matches!(
            store.create_request(&req).await,
            Err(PersistenceError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn soft_deleted_requests_are_invisible() {
        let store = InMemoryStore::new();
        let mut req = request();
        req.deleted_at = Some(Utc::now());
        store.create_request(&req).await.unwrap();
        assert!(store.get_request(req.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_iteration_advances_current_iteration_atomically() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();

        store.append_iteration(req.id, snapshot(1)).await.unwrap();
        store.append_iteration(req.id, snapshot(2)).await.unwrap();

        let loaded = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_iteration, 2);
        assert_eq!(loaded.iterations.len(), 2);
        assert!(loaded.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn out_of_order_iteration_is_rejected() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();

        let err = store.append_iteration(req.id, snapshot(2)).await;
        assert!(matches!(err, Err(PersistenceError::Constraint(_))));

        store.append_iteration(req.id, snapshot(1)).await.unwrap();
        let err = store.append_iteration(req.id, snapshot(1)).await;
        assert!(matches!(err, Err(PersistenceError::Constraint(_))));
    }

    #[tokio::test]
    async fn decreasing_costs_are_rejected() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();

        let mut costs = CostTracker::default();
        costs.add_llm_tokens(100, 0.01);
        store.update_costs(req.id, &costs).await.unwrap();

        let err = store.update_costs(req.id, &CostTracker::default()).await;
        assert!(matches!(err, Err(PersistenceError::Constraint(_))));
    }

    #[tokio::test]
    async fn finish_requires_terminal_status() {
        let store = InMemoryStore::new();
        let req = request();
        store.create_request(&req).await.unwrap();

        let err = store
            .finish_request(req.id, RequestStatus::Generating, None, None, None, Utc::now())
            .await;
        assert!(matches!(err, Err(PersistenceError::Constraint(_))));

        store
            .finish_request(
                req.id,
                RequestStatus::Failed,
                Some(CompletionReason::Error),
                None,
                Some("boom".into()),
                Utc::now(),
            )
            .await
            .unwrap();
        let loaded = store.get_request(req.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn judges_load_in_requested_order() {
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let judge = JudgeAgent {
                id: Uuid::new_v4(),
                organization_id: Uuid::new_v4(),
                name: name.into(),
                system_prompt: "judge".into(),
                judge_prompt: None,
                scoring_weight: 50.0,
                can_judge: true,
                evaluation_categories: None,
                rag: Default::default(),
                model_tier: None,
                documents: vec![],
            };
            store.save_judge(&judge).await.unwrap();
            ids.push(judge.id);
        }
        let loaded = store.get_judges(&[ids[2], ids[0]]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "c");
        assert_eq!(loaded[1].name, "a");
    }

    #[tokio::test]
    async fn images_list_sorted_by_iteration() {
        let store = InMemoryStore::new();
        let request_id = Uuid::new_v4();
        let make = |iteration| GeneratedImage {
            id: Uuid::new_v4(),
            request_id,
            iteration_number: iteration,
            storage_key: "k".into(),
            public_url: "u".into(),
            prompt_used: "p".into(),
            mime_type: "image/png".into(),
            file_size_bytes: 10,
            created_at: Utc::now(),
        };
        store.save_images(&[make(2), make(1)]).await.unwrap();
        let images = store.list_request_images(request_id).await.unwrap();
        assert_eq!(images[0].iteration_number, 1);
        assert_eq!(images[1].iteration_number, 2);
    }

    #[tokio::test]
    async fn optimizer_singleton_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.load_optimizer().await.unwrap().is_none());
        let settings = OptimizerSettings {
            system_prompt: "sys".into(),
            model: "m".into(),
            temperature: 0.7,
            max_tokens: 1000,
        };
        store.save_optimizer(&settings).await.unwrap();
        let loaded = store.load_optimizer().await.unwrap().unwrap();
        assert_eq!(loaded.model, "m");
    }
}
