//! LLM wire types and the provider trait.

pub mod provider;
pub mod types;

pub use provider::{DynLlmProvider, LlmProvider};
pub use types::*;
