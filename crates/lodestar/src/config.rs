//! File and environment configuration.
//!
//! Settings come from an optional TOML file, then environment overrides.
//! Every field has a default, so an empty file (or no file) is valid.
//!
//! ```toml
//! [agent]
//! model = "anthropic/claude-sonnet-4"
//! max_iterations = 40
//! tool_timeout_secs = 120
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 500
//!
//! [breaker]
//! max_failures = 5
//! reset_timeout_secs = 60
//!
//! [context]
//! strategy = "selective_pruning"
//! max_tokens = 100000
//! preserve_types = ["architecture", "user-intent"]
//!
//! [checkpoints]
//! dir = ".lodestar/sessions"
//! keep_last = 5
//! ```
//!
//! Environment overrides: `LODESTAR_MODEL`, `LODESTAR_MAX_ITERATIONS`,
//! `LODESTAR_STRATEGY`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{AgentConfig, DEFAULT_CONTEXT_TOKENS, DEFAULT_MAX_ITERATIONS};
use crate::checkpoint::DEFAULT_KEEP_LAST;
use crate::context::OptimizationConfig;
use crate::error::{Error, Result};
use crate::resilience::{BreakerConfig, ErrorRecovery, RetryPolicy};
use crate::tools::{DEFAULT_MAX_RESULT_BYTES, ToolRegistry};

/// Config file the CLI picks up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lodestar.toml";

pub const ENV_MODEL: &str = "LODESTAR_MODEL";
pub const ENV_MAX_ITERATIONS: &str = "LODESTAR_MAX_ITERATIONS";
pub const ENV_STRATEGY: &str = "LODESTAR_STRATEGY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodestarConfig {
    pub agent: AgentSection,
    pub retry: RetrySection,
    pub breaker: BreakerSection,
    pub context: OptimizationConfig,
    pub checkpoints: CheckpointSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Token budget of the injected `<context>` block.
    pub context_tokens: usize,
    /// Consecutive tool failures before a run is aborted.
    pub max_consecutive_errors: u32,
    pub tool_timeout_secs: Option<u64>,
    pub max_result_bytes: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: 4096,
            temperature: 0.3,
            context_tokens: DEFAULT_CONTEXT_TOKENS,
            max_consecutive_errors: 3,
            tool_timeout_secs: None,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub max_failures: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub dir: PathBuf,
    pub keep_last: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".lodestar/sessions"),
            keep_last: DEFAULT_KEEP_LAST,
        }
    }
}

impl LodestarConfig {
    /// Load from `path` (or defaults when `None`), apply environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read config file {}", path.display()))
                        .with_source(e)
                })?;
                debug!("Loaded config from {}", path.display());
                Self::parse(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without environment overrides or validation.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")).with_source(e))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("failed to serialize config: {e}")).with_source(e))
    }

    /// Apply overrides from a variable lookup. Unset variables are skipped;
    /// malformed values are a config error.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.trim().is_empty()) {
            self.agent.model = model;
        }
        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            self.agent.max_iterations = raw.trim().parse().map_err(|_| {
                Error::config(format!("{ENV_MAX_ITERATIONS} must be a positive integer, got '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_STRATEGY) {
            self.context.strategy = raw.trim().parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.context.validate()?;
        if self.agent.max_iterations == 0 {
            return Err(Error::config("agent.max_iterations must be at least 1"));
        }
        if self.agent.model.trim().is_empty() {
            return Err(Error::config("agent.model must not be empty"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.breaker.max_failures,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
        }
    }

    pub fn error_recovery(&self) -> ErrorRecovery {
        ErrorRecovery::new(self.agent.max_consecutive_errors, self.breaker_config())
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(&self.agent.model)
            .with_max_iterations(self.agent.max_iterations)
            .with_max_tokens(self.agent.max_tokens)
            .with_temperature(self.agent.temperature)
            .with_context_tokens(self.agent.context_tokens)
            .with_retry(self.retry_policy());
        if let Some(prompt) = &self.agent.system_prompt {
            config = config.with_system_prompt(prompt);
        }
        config
    }

    /// An empty registry carrying the configured output limit and timeout.
    pub fn tool_registry(&self) -> ToolRegistry {
        let registry = ToolRegistry::new().with_max_result_bytes(self.agent.max_result_bytes);
        match self.agent.tool_timeout_secs {
            Some(secs) => registry.with_timeout(Duration::from_secs(secs)),
            None => registry,
        }
    }
}
