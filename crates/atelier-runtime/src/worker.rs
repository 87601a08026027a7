//! Worker pool: leases jobs and drives the orchestrator.

use std::sync::Arc;

use atelier_kernel::request::{CompletionReason, RequestStatus};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use atelier_foundation::persistence::{DynPersistence, RequestStore};

use crate::orchestrator::Orchestrator;
use crate::queue::{DynJobQueue, LeasedJob, NackOutcome};

/// A running pool of worker tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `count` workers over a shared queue. Stale leases from a
    /// previous process are requeued before the first worker starts.
    pub async fn start(
        count: usize,
        queue: DynJobQueue,
        orchestrator: Arc<Orchestrator>,
        store: DynPersistence,
    ) -> Self {
        let recovered = queue.recover_stale_leases().await;
        if recovered > 0 {
            info!(recovered, "requeued jobs from stale leases");
        }

        let (shutdown, _) = watch::channel(false);
        let handles = (0..count.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let orchestrator = Arc::clone(&orchestrator);
                let store = Arc::clone(&store);
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            leased = queue.lease() => {
                                run_job(worker_id, &queue, &orchestrator, &store, leased).await;
                            }
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect();

        Self { handles, shutdown }
    }

    /// Signal shutdown and wait for every worker to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_job(
    worker_id: usize,
    queue: &DynJobQueue,
    orchestrator: &Orchestrator,
    store: &DynPersistence,
    leased: LeasedJob,
) {
    let request_id = leased.job.request_id;
    info!(worker_id, %request_id, attempt = leased.attempt, "job leased");

    match orchestrator.execute_request(request_id).await {
        Ok(()) => {
            if let Err(e) = queue.ack(leased).await {
                error!(worker_id, %request_id, error = %e, "ack failed");
            }
        }
        Err(e) => {
            warn!(worker_id, %request_id, error = %e, "execution threw, nacking");
            match queue.nack(leased).await {
                Ok(NackOutcome::Requeued { attempt }) => {
                    info!(%request_id, attempt, "job requeued");
                }
                Ok(NackOutcome::Exhausted(job)) => {
                    error!(request_id = %job.request_id, "job retries exhausted, marking request failed");
                    let message = format!("job retries exhausted: {e}");
                    if let Err(persist_err) = store
                        .finish_request(
                            job.request_id,
                            RequestStatus::Failed,
                            Some(CompletionReason::Error),
                            None,
                            Some(message),
                            Utc::now(),
                        )
                        .await
                    {
                        error!(request_id = %job.request_id, error = %persist_err, "could not mark exhausted request failed");
                    }
                }
                Err(nack_err) => {
                    error!(worker_id, %request_id, error = %nack_err, "nack failed");
                }
            }
        }
    }
}
