//! Per-request event bus.
//!
//! Each request gets a lazily created broadcast subject. Subscriptions are
//! ref-counted: when the last subscriber drops, the subject is removed.
//! Terminal events (`COMPLETED` / `FAILED`) complete every active stream
//! and drop the subject from the registry.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Default per-subject buffer size.
const DEFAULT_BUFFER_SIZE: usize = 256;

/// Lifecycle event types delivered to request subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InitialState,
    StatusChange,
    IterationComplete,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::InitialState => "initial_state",
            EventKind::StatusChange => "status_change",
            EventKind::IterationComplete => "iteration_complete",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }

    /// Terminal kinds complete the stream and remove the subject.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Failed)
    }
}

/// One event on a request's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub request_id: Uuid,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RequestEvent {
    pub fn new(kind: EventKind, request_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind,
            request_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Lock-free bus counters.
#[derive(Debug, Default)]
pub struct BusMetrics {
    emitted: AtomicU64,
    dropped_no_subscriber: AtomicU64,
    lagged: AtomicU64,
}

impl BusMetrics {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped_no_subscriber(&self) -> u64 {
        self.dropped_no_subscriber.load(Ordering::Relaxed)
    }

    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emitted: self.emitted(),
            dropped_no_subscriber: self.dropped_no_subscriber(),
            lagged: self.lagged(),
        }
    }
}

/// Serializable view of [`BusMetrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub emitted: u64,
    pub dropped_no_subscriber: u64,
    pub lagged: u64,
}

struct Subject {
    tx: broadcast::Sender<RequestEvent>,
    subscribers: usize,
}

struct BusInner {
    subjects: RwLock<HashMap<Uuid, Subject>>,
    metrics: BusMetrics,
    buffer_size: usize,
}

/// Per-request fan-out of lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subjects: RwLock::new(HashMap::new()),
                metrics: BusMetrics::default(),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }

    /// Subscribe to a request's events, creating the subject on first use.
    ///
    /// The returned subscription decrements the subject's ref count on drop;
    /// at zero the subject is removed. The caller is responsible for
    /// synthesizing the leading `INITIAL_STATE` event from persisted state,
    /// which closes the race with in-flight iterations.
    pub fn subscribe(&self, request_id: Uuid) -> EventSubscription {
        let mut subjects = self.inner.subjects.write();
        let subject = subjects.entry(request_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.inner.buffer_size);
            Subject { tx, subscribers: 0 }
        });
        subject.subscribers += 1;
        let receiver = subject.tx.subscribe();
        EventSubscription {
            receiver,
            guard: SubscriberGuard {
                inner: Arc::clone(&self.inner),
                request_id,
            },
        }
    }

    /// Current subscriber count for a request (0 when no subject exists).
    pub fn subscriber_count(&self, request_id: Uuid) -> usize {
        self.inner
            .subjects
            .read()
            .get(&request_id)
            .map(|s| s.subscribers)
            .unwrap_or(0)
    }

    /// Emit an event to a request's subscribers.
    ///
    /// A no-op when no subject exists. Terminal kinds complete the stream by
    /// dropping the subject; subsequent emits for the same request are
    /// no-ops again. Returns whether the event reached a live subject.
    pub fn emit(&self, request_id: Uuid, kind: EventKind, data: serde_json::Value) -> bool {
        let event = RequestEvent::new(kind, request_id, data);
        let mut subjects = self.inner.subjects.write();
        let Some(subject) = subjects.get(&request_id) else {
            self.inner
                .metrics
                .dropped_no_subscriber
                .fetch_add(1, Ordering::Relaxed);
            return false;
        };

        // send() errors only when every receiver is gone; the subject is
        // still cleaned up below for terminal kinds.
        if subject.tx.send(event).is_ok() {
            self.inner.metrics.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner
                .metrics
                .dropped_no_subscriber
                .fetch_add(1, Ordering::Relaxed);
        }

        if kind.is_terminal() {
            subjects.remove(&request_id);
        }
        true
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop guard that decrements the subject's subscriber count.
struct SubscriberGuard {
    inner: Arc<BusInner>,
    request_id: Uuid,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut subjects = self.inner.subjects.write();
        // The subject may already be gone after a terminal event.
        if let Some(subject) = subjects.get_mut(&self.request_id) {
            subject.subscribers = subject.subscribers.saturating_sub(1);
            if subject.subscribers == 0 {
                subjects.remove(&self.request_id);
            }
        }
    }
}

/// One subscriber's live stream over a request subject.
pub struct EventSubscription {
    receiver: broadcast::Receiver<RequestEvent>,
    guard: SubscriberGuard,
}

impl EventSubscription {
    /// Next event, or `None` once the subject completed.
    ///
    /// A lagged receiver skips the gap and continues with the next available
    /// event; the loss is recorded in the bus metrics.
    pub async fn next(&mut self) -> Option<RequestEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.guard
                        .inner
                        .metrics
                        .lagged
                        .fetch_add(n, Ordering::Relaxed);
                    warn!(missed = n, "event subscriber lagged, skipping");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        assert!(!bus.emit(id, EventKind::StatusChange, json!({"status": "OPTIMIZING"})));
        assert_eq!(bus.metrics().dropped_no_subscriber(), 1);
        assert_eq!(bus.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn two_subscribers_both_receive_every_event() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut a = bus.subscribe(id);
        let mut b = bus.subscribe(id);
        assert_eq!(bus.subscriber_count(id), 2);

        bus.emit(id, EventKind::StatusChange, json!({"status": "GENERATING"}));
        bus.emit(id, EventKind::IterationComplete, json!({"iteration": 1}));

        for sub in [&mut a, &mut b] {
            let first = sub.next().await.unwrap();
            assert_eq!(first.kind, EventKind::StatusChange);
            let second = sub.next().await.unwrap();
            assert_eq!(second.kind, EventKind::IterationComplete);
        }
    }

    #[tokio::test]
    async fn unsubscribing_one_does_not_affect_the_other() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let a = bus.subscribe(id);
        let mut b = bus.subscribe(id);

        drop(a);
        assert_eq!(bus.subscriber_count(id), 1);

        bus.emit(id, EventKind::StatusChange, json!({}));
        assert_eq!(b.next().await.unwrap().kind, EventKind::StatusChange);
    }

    #[tokio::test]
    async fn subject_removed_when_all_unsubscribe() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let a = bus.subscribe(id);
        let b = bus.subscribe(id);
        drop(a);
        drop(b);
        assert_eq!(bus.subscriber_count(id), 0);
        // The subject is gone, so emits are no-ops again.
        assert!(!bus.emit(id, EventKind::StatusChange, json!({})));
    }

    #[tokio::test]
    async fn terminal_event_completes_all_subscriptions() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut a = bus.subscribe(id);
        let mut b = bus.subscribe(id);

        bus.emit(id, EventKind::Completed, json!({"reason": "SUCCESS"}));

        assert_eq!(a.next().await.unwrap().kind, EventKind::Completed);
        assert_eq!(b.next().await.unwrap().kind, EventKind::Completed);
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());

        // Subsequent emits on the same request are no-ops.
        assert!(!bus.emit(id, EventKind::StatusChange, json!({})));
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_and_continues() {
        let bus = EventBus::with_buffer_size(2);
        let id = Uuid::new_v4();
        let mut sub = bus.subscribe(id);

        for i in 0..5 {
            bus.emit(id, EventKind::IterationComplete, json!({"iteration": i}));
        }

        // The oldest events were overwritten; the stream resumes without error.
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, EventKind::IterationComplete);
        assert!(bus.metrics().lagged() > 0);
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::InitialState.as_str(), "initial_state");
        assert_eq!(EventKind::Completed.as_str(), "completed");
        assert!(EventKind::Completed.is_terminal());
        assert!(EventKind::Failed.is_terminal());
        assert!(!EventKind::IterationComplete.is_terminal());
    }
}
