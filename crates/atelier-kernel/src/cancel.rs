//! Process-wide cancellation registry.
//!
//! Cancellation is cooperative: API handlers set the flag, and the
//! orchestrator polls it at every iteration boundary and before each
//! long-running phase.

use dashmap::DashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Concurrent set of request ids flagged for cancellation.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    cancelled: Arc<DashSet<Uuid>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a request for cancellation.
    pub fn cancel(&self, request_id: Uuid) {
        self.cancelled.insert(request_id);
    }

    pub fn is_cancelled(&self, request_id: Uuid) -> bool {
        self.cancelled.contains(&request_id)
    }

    /// Clear the flag once the orchestrator has persisted the terminal state.
    pub fn clear(&self, request_id: Uuid) {
        self.cancelled.remove(&request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_round_trip() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.is_cancelled(id));
        registry.cancel(id);
        assert!(registry.is_cancelled(id));
        registry.clear(id);
        assert!(!registry.is_cancelled(id));
    }

    #[test]
    fn clones_share_state() {
        let registry = CancellationRegistry::new();
        let clone = registry.clone();
        let id = Uuid::new_v4();
        clone.cancel(id);
        assert!(registry.is_cancelled(id));
    }
}
