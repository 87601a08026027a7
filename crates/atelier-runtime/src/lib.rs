//! Atelier runtime: the iteration orchestrator, retry policies, the job
//! queue and worker pool, and the narrow HTTP handoff surface.

// retry policies
pub mod retry;
pub use retry::{retry_with_policy, RetryConfig, RetryPolicy};

// iteration orchestrator
pub mod orchestrator;
pub use orchestrator::{Orchestrator, OrchestratorContext};

// job queue
pub mod queue;
pub use queue::{DynJobQueue, InMemoryJobQueue, Job, JobQueue, LeasedJob, NackOutcome};

// worker pool
pub mod worker;
pub use worker::WorkerPool;

// HTTP handoff
pub mod server;
pub use server::{router, AppState};
