//! Iteration orchestrator: the per-request state machine, strategy
//! selection and termination detection.

pub mod engine;
pub mod strategy;

pub use engine::{Orchestrator, OrchestratorContext, RUN_DEADLINE};
pub use strategy::{is_plateaued, select_strategy, Strategy, StrategyInputs};
