//! Narrow HTTP handoff surface.
//!
//! Three routes only: job dispatch into the queue, cancellation, and the
//! per-request SSE event stream. Everything else (CRUD, auth, uploads) is
//! an external collaborator.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use atelier_kernel::cancel::CancellationRegistry;
use atelier_kernel::events::{EventBus, EventKind, RequestEvent};
use atelier_kernel::request::RequestStatus;

use atelier_foundation::persistence::{DynPersistence, ImageStore, RequestStore};

use crate::queue::{DynJobQueue, Job};

/// Shared state of the handoff routes.
#[derive(Clone)]
pub struct AppState {
    pub store: DynPersistence,
    pub queue: DynJobQueue,
    pub bus: EventBus,
    pub cancel: CancellationRegistry,
    /// Expected bearer token for the event stream, if auth is enabled.
    pub stream_token: Option<String>,
}

/// Build the handoff router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/requests/{id}/dispatch", post(dispatch))
        .route("/requests/{id}", delete(cancel))
        .route("/requests/{id}/events", get(events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DispatchBody {
    organization_id: Uuid,
}

/// Enqueue a request for the worker pool.
async fn dispatch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DispatchBody>,
) -> impl IntoResponse {
    match state.store.get_request(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, Json(json!({"error": "request not found"}))),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            );
        }
    }

    let job = Job {
        request_id: id,
        organization_id: body.organization_id,
    };
    match state.queue.enqueue(job).await {
        Ok(()) => {
            info!(request_id = %id, "job dispatched");
            (StatusCode::ACCEPTED, Json(json!({"status": "queued"})))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

/// Flag a request for cancellation.
///
/// The stored status flips toward CANCELLED immediately; the orchestrator
/// observes the registry flag at its next boundary and persists the
/// terminal state.
async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    state.cancel.cancel(id);
    if let Err(e) = state.store.update_status(id, RequestStatus::Cancelled).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        );
    }
    info!(request_id = %id, "cancellation requested");
    (StatusCode::ACCEPTED, Json(json!({"status": "cancelling"})))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Bearer token as a query parameter; the SSE client cannot send
    /// headers.
    token: Option<String>,
}

/// Per-request SSE stream.
///
/// Subscribes before reading the snapshot so no event falls between the
/// `initial_state` synthesis and the live stream.
async fn events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    if let Some(expected) = &state.stream_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let subscription = state.bus.subscribe(id);

    let request = state
        .store
        .get_request(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let images = state
        .store
        .list_request_images(id)
        .await
        .unwrap_or_default();

    let initial = RequestEvent::new(
        EventKind::InitialState,
        id,
        json!({ "request": request, "images": images }),
    );

    let first = stream::once(async move { Ok(to_sse(&initial)) });
    let live = stream::unfold(subscription, |mut subscription| async move {
        subscription
            .next()
            .await
            .map(|event| (Ok(to_sse(&event)), subscription))
    });

    Ok(Sse::new(first.chain(live)).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &RequestEvent) -> SseEvent {
    let payload = json!({
        "type": event.kind.as_str(),
        "data": event.data,
        "timestamp": event.timestamp,
        "id": event.request_id,
    });
    SseEvent::default()
        .event(event.kind.as_str())
        .id(event.timestamp.timestamp_millis().to_string())
        .data(serde_json::to_string(&payload).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_foundation::persistence::InMemoryStore;
    use atelier_kernel::request::GenerationRequest;
    use std::sync::Arc;

    use crate::queue::InMemoryJobQueue;

    fn state() -> AppState {
        AppState {
            store: Arc::new(InMemoryStore::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            bus: EventBus::new(),
            cancel: CancellationRegistry::new(),
            stream_token: None,
        }
    }

    #[tokio::test]
    async fn dispatch_enqueues_known_requests() {
        let state = state();
        let request = GenerationRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "A red apple",
            vec![Uuid::new_v4()],
        );
        state.store.create_request(&request).await.unwrap();

        let response = dispatch(
            State(state.clone()),
            Path(request.id),
            Json(DispatchBody {
                organization_id: request.organization_id,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.queue.pending().await, 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_requests() {
        let state = state();
        let response = dispatch(
            State(state.clone()),
            Path(Uuid::new_v4()),
            Json(DispatchBody {
                organization_id: Uuid::new_v4(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.queue.pending().await, 0);
    }

    #[tokio::test]
    async fn cancel_sets_flag_and_status() {
        let state = state();
        let request = GenerationRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "A red apple",
            vec![Uuid::new_v4()],
        );
        state.store.create_request(&request).await.unwrap();

        let response = cancel(State(state.clone()), Path(request.id))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(state.cancel.is_cancelled(request.id));
        let stored = state.store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Cancelled);
    }

    #[test]
    fn sse_frames_carry_type_and_payload() {
        let event = RequestEvent::new(
            EventKind::IterationComplete,
            Uuid::new_v4(),
            json!({"iteration": 2}),
        );
        // The SSE event builder is opaque; this mostly pins the payload
        // shape via the serializer.
        let payload = json!({
            "type": event.kind.as_str(),
            "data": event.data,
            "timestamp": event.timestamp,
            "id": event.request_id,
        });
        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("\"iteration_complete\""));
        assert!(text.contains("\"iteration\":2"));
        let _ = to_sse(&event);
    }
}
