//! Configuration for the [`AgentLoop`](super::AgentLoop).
//!
//! ```ignore
//! let config = AgentConfig::new("anthropic/claude-sonnet-4")
//!     .with_system_prompt("You are a careful refactoring assistant.")
//!     .with_max_iterations(40)
//!     .with_retry(RetryPolicy::default().with_max_attempts(5));
//! ```

use crate::resilience::RetryPolicy;

/// Default upper bound on completion calls per run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// Default token budget for the injected `<context>` block.
pub const DEFAULT_CONTEXT_TOKENS: usize = 8_000;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Policy for completion calls. Tool calls are never retried.
    pub retry: RetryPolicy,
    /// Token budget for context fetched from the context manager when the
    /// request carries none.
    pub context_tokens: usize,
    /// Record the user message and tool results as context items.
    pub record_context: bool,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context_tokens(mut self, tokens: usize) -> Self {
        self.context_tokens = tokens;
        self
    }

    pub fn with_record_context(mut self, record: bool) -> Self {
        self.record_context = record;
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: 4096,
            temperature: 0.3,
            retry: RetryPolicy::default(),
            context_tokens: DEFAULT_CONTEXT_TOKENS,
            record_context: true,
        }
    }
}
