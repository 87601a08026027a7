//! Durable FIFO job queue with at-least-once delivery.
//!
//! Intake enqueues one job per request; workers lease, run the orchestrator
//! and ACK on a clean terminal, or NACK to redeliver. Redelivery is bounded;
//! an exhausted job is handed back so the worker can mark the request
//! FAILED.

use async_trait::async_trait;
use atelier_kernel::error::{EngineError, EngineResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// Redeliveries before a job is exhausted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// One unit of dispatch work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub request_id: Uuid,
    pub organization_id: Uuid,
}

/// A job held by a worker until ACK/NACK.
#[derive(Debug)]
pub struct LeasedJob {
    pub job: Job,
    /// 1-based delivery count.
    pub attempt: u32,
}

/// What happened to a NACKed job.
#[derive(Debug)]
pub enum NackOutcome {
    /// Back in the queue for another delivery.
    Requeued { attempt: u32 },
    /// Delivery budget spent; the job is dropped and returned.
    Exhausted(Job),
}

/// FIFO queue keyed by request id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job. A request already pending or leased is not enqueued
    /// twice.
    async fn enqueue(&self, job: Job) -> EngineResult<()>;

    /// Wait for the next job.
    async fn lease(&self) -> LeasedJob;

    /// Take the next job if one is ready.
    async fn try_lease(&self) -> Option<LeasedJob>;

    /// Acknowledge a clean terminal; the job is done.
    async fn ack(&self, leased: LeasedJob) -> EngineResult<()>;

    /// Return a failed job for redelivery.
    async fn nack(&self, leased: LeasedJob) -> EngineResult<NackOutcome>;

    /// Requeue jobs leased by workers that never came back. Called on
    /// worker-pool start; returns how many jobs were recovered.
    async fn recover_stale_leases(&self) -> usize;

    /// Pending jobs (not counting leased ones).
    async fn pending(&self) -> usize;
}

/// Shared, dynamically dispatched queue handle.
pub type DynJobQueue = Arc<dyn JobQueue>;

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<(Job, u32)>,
    leased: HashMap<Uuid, (Job, u32)>,
}

/// In-memory queue for tests and single-process deployments.
pub struct InMemoryJobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_attempts: u32,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let already_known = inner
            .pending
            .iter()
            .any(|(j, _)| j.request_id == job.request_id)
            || inner.leased.contains_key(&job.request_id);
        if already_known {
            debug!(request_id = %job.request_id, "job already queued, skipping duplicate");
            return Ok(());
        }
        inner.pending.push_back((job, 0));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self) -> LeasedJob {
        loop {
            let notified = self.notify.notified();
            if let Some(leased) = self.try_lease().await {
                return leased;
            }
            notified.await;
        }
    }

    async fn try_lease(&self) -> Option<LeasedJob> {
        let mut inner = self.inner.lock().await;
        let (job, deliveries) = inner.pending.pop_front()?;
        let attempt = deliveries + 1;
        inner.leased.insert(job.request_id, (job.clone(), attempt));
        Some(LeasedJob { job, attempt })
    }

    async fn ack(&self, leased: LeasedJob) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .leased
            .remove(&leased.job.request_id)
            .map(|_| ())
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "ack for unleased job {}",
                    leased.job.request_id
                ))
            })
    }

    async fn nack(&self, leased: LeasedJob) -> EngineResult<NackOutcome> {
        let mut inner = self.inner.lock().await;
        let (job, attempt) = inner
            .leased
            .remove(&leased.job.request_id)
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "nack for unleased job {}",
                    leased.job.request_id
                ))
            })?;

        if attempt >= self.max_attempts {
            return Ok(NackOutcome::Exhausted(job));
        }
        inner.pending.push_back((job, attempt));
        drop(inner);
        self.notify.notify_one();
        Ok(NackOutcome::Requeued { attempt })
    }

    async fn recover_stale_leases(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let stale: Vec<(Job, u32)> = inner.leased.drain().map(|(_, v)| v).collect();
        let count = stale.len();
        for entry in stale {
            inner.pending.push_back(entry);
        }
        drop(inner);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    async fn pending(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}
