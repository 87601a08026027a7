//! LLM provider implementations and multimodal helpers.

pub mod openai;
pub mod vision;

pub use openai::{OpenAiConfig, OpenAiProvider};
