//! Atelier kernel: domain model, core traits and the per-request event bus
//! for the iterative image-refinement engine.

// error module
pub mod error;
pub use error::{CoreError, CoreResult, EngineError, EngineResult};

// request aggregate
pub mod request;
pub use request::*;

// judge-side types
pub mod judge;
pub use judge::*;

// LLM wire types and provider trait
pub mod llm;

// per-request event bus
pub mod events;
pub use events::{EventBus, EventKind, EventSubscription, RequestEvent};

// cancellation registry
pub mod cancel;
pub use cancel::CancellationRegistry;

// pricing registry
pub mod pricing;
pub use pricing::{ModelPricing, PricingRegistry};

// engine configuration
pub mod config;
pub use config::EngineConfig;
