//! Run identifiers and cost estimation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::Usage;

/// Generate a unique identifier for one agent run, used to correlate logs.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts:x}-{count:04x}")
}

/// Per-model pricing in USD per 1M tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn estimate_cost(&self, usage: Usage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Approximate pricing for a model.
///
/// Matches on the segment after the last `/` so org prefixes such as
/// `my-org/custom-sonnet-finetune` do not skew the match. Figures are for
/// spotting runaway loops, not billing.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else if name.contains("sonnet") {
        ModelPricing::new(3.0, 15.0)
    } else if name.contains("haiku") {
        ModelPricing::new(0.25, 1.25)
    } else if name.contains("4o-mini") {
        ModelPricing::new(0.15, 0.60)
    } else if name.contains("gpt-4") {
        ModelPricing::new(2.50, 10.0)
    } else if name.starts_with("o1") || name.starts_with("o3") {
        ModelPricing::new(15.0, 60.0)
    } else if name.contains("gemini") && name.contains("flash") {
        ModelPricing::new(0.075, 0.30)
    } else if name.contains("gemini") {
        ModelPricing::new(1.25, 5.0)
    } else if name.contains("deepseek") {
        ModelPricing::new(0.27, 1.10)
    } else {
        ModelPricing::default()
    }
}

/// Cumulative usage and cost across the calls of one run.
#[derive(Debug, Default, Clone)]
pub struct CostTracker {
    pub usage: Usage,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: Usage, pricing: &ModelPricing) {
        self.usage.add(usage);
        self.estimated_cost_usd += pricing.estimate_cost(usage);
    }

    pub fn summary(&self) -> String {
        format!(
            "tokens: {} prompt + {} completion = {} total, est. cost: ${:.4}",
            self.usage.prompt_tokens,
            self.usage.completion_tokens,
            self.usage.total(),
            self.estimated_cost_usd,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    #[test]
    fn trace_id_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
    }

    #[test]
    fn cost_estimation() {
        let cost = ModelPricing::new(3.0, 15.0).estimate_cost(usage(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 0.01);
    }

    #[test]
    fn tracker_accumulates() {
        let mut tracker = CostTracker::new();
        let pricing = ModelPricing::default();
        tracker.record(usage(1000, 500), &pricing);
        tracker.record(usage(2000, 1000), &pricing);
        assert_eq!(tracker.usage.prompt_tokens, 3000);
        assert_eq!(tracker.usage.completion_tokens, 1500);
        assert!(tracker.estimated_cost_usd > 0.0);
        assert!(tracker.summary().contains("4500 total"));
    }

    #[test]
    fn pricing_lookup() {
        assert!(pricing_for_model("anthropic/claude-opus-4").input_per_million > 10.0);
        assert!(pricing_for_model("anthropic/claude-3.5-haiku").input_per_million < 1.0);
        assert_eq!(
            pricing_for_model("my-org/custom-sonnet-finetune"),
            ModelPricing::new(3.0, 15.0)
        );
        assert_eq!(pricing_for_model("unknown/model"), ModelPricing::default());
    }
}
