//! Model pricing registry.
//!
//! Feeds the per-request cost accumulator with USD estimates for chat,
//! embedding and image-generation calls.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-model pricing (USD per 1,000 tokens).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k_tokens: f64,
    pub output_cost_per_1k_tokens: f64,
}

impl ModelPricing {
    pub fn new(input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        Self {
            input_cost_per_1k_tokens: input_cost_per_1k,
            output_cost_per_1k_tokens: output_cost_per_1k,
        }
    }

    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn calculate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let input_cost = (prompt_tokens as f64 / 1000.0) * self.input_cost_per_1k_tokens;
        let output_cost = (completion_tokens as f64 / 1000.0) * self.output_cost_per_1k_tokens;
        input_cost + output_cost
    }
}

/// Pricing lookup for the models the engine calls.
#[derive(Debug, Clone)]
pub struct PricingRegistry {
    models: HashMap<String, ModelPricing>,
    /// USD per 1k embedding tokens.
    embedding_cost_per_1k_tokens: f64,
    /// Flat USD per generated image.
    cost_per_image: f64,
}

impl PricingRegistry {
    /// Registry preloaded with prices for the default model set.
    pub fn with_defaults() -> Self {
        let mut models = HashMap::new();
        models.insert("gpt-4o".into(), ModelPricing::new(2.50, 10.00));
        models.insert("gpt-4o-mini".into(), ModelPricing::new(0.15, 0.60));
        Self {
            models,
            embedding_cost_per_1k_tokens: 0.00002,
            cost_per_image: 0.04,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn with_image_cost(mut self, usd_per_image: f64) -> Self {
        self.cost_per_image = usd_per_image;
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Chat cost estimate; unknown models estimate as free.
    pub fn estimate_chat(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.models
            .get(model)
            .map(|p| p.calculate_cost(prompt_tokens, completion_tokens))
            .unwrap_or(0.0)
    }

    pub fn estimate_embedding(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.embedding_cost_per_1k_tokens
    }

    pub fn estimate_images(&self, count: u64) -> f64 {
        count as f64 * self.cost_per_image
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_cost_scales_with_tokens() {
        let pricing = ModelPricing::new(2.50, 10.00);
        let cost = pricing.calculate_cost(1000, 500);
        assert!((cost - (2.50 + 5.00)).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_estimates_as_free() {
        let registry = PricingRegistry::with_defaults();
        assert_eq!(registry.estimate_chat("mystery-model", 1000, 1000), 0.0);
    }

    #[test]
    fn image_cost_is_per_image() {
        let registry = PricingRegistry::with_defaults().with_image_cost(0.08);
        assert!((registry.estimate_images(4) - 0.32).abs() < 1e-9);
    }

    #[test]
    fn free_pricing_costs_nothing() {
        assert_eq!(ModelPricing::free().calculate_cost(10_000, 10_000), 0.0);
    }
}
