//! Per-session optimization policy.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::item::{ContextItem, ItemType};
use crate::error::{Error, Result};

/// Relevance at or above which an item is always preserved.
pub const PRESERVE_RELEVANCE: f64 = 0.9;

/// Which optimization algorithm a session uses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AggressiveSummarization,
    SelectivePruning,
    SemanticChunking,
    TieredEviction,
    #[default]
    Balanced,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::AggressiveSummarization,
        StrategyKind::SelectivePruning,
        StrategyKind::SemanticChunking,
        StrategyKind::TieredEviction,
        StrategyKind::Balanced,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::AggressiveSummarization => "aggressive_summarization",
            StrategyKind::SelectivePruning => "selective_pruning",
            StrategyKind::SemanticChunking => "semantic_chunking",
            StrategyKind::TieredEviction => "tiered_eviction",
            StrategyKind::Balanced => "balanced",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown optimization strategy: {s}")))
    }
}

fn default_max_tokens() -> usize {
    100_000
}

fn default_min_relevance() -> f64 {
    0.3
}

fn default_preserve_types() -> BTreeSet<ItemType> {
    BTreeSet::from([ItemType::Architecture])
}

fn default_threshold() -> f64 {
    0.8
}

/// Optimization policy for one session.
///
/// Deserializes from the `[context]` section of the config file; every field
/// is optional there.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OptimizationConfig {
    pub strategy: StrategyKind,
    pub max_tokens: usize,
    /// Falls back to `max_tokens / 2` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_tokens: Option<usize>,
    pub min_relevance: f64,
    pub preserve_types: BTreeSet<ItemType>,
    pub auto_optimize: bool,
    pub optimize_threshold: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            max_tokens: default_max_tokens(),
            target_tokens: None,
            min_relevance: default_min_relevance(),
            preserve_types: default_preserve_types(),
            auto_optimize: true,
            optimize_threshold: default_threshold(),
        }
    }
}

impl OptimizationConfig {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_target_tokens(mut self, target: usize) -> Self {
        self.target_tokens = Some(target);
        self
    }

    pub fn with_min_relevance(mut self, min: f64) -> Self {
        self.min_relevance = min;
        self
    }

    pub fn with_auto_optimize(mut self, enabled: bool) -> Self {
        self.auto_optimize = enabled;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.optimize_threshold = threshold;
        self
    }

    pub fn preserve(mut self, item_type: ItemType) -> Self {
        self.preserve_types.insert(item_type);
        self
    }

    /// Effective target size.
    pub fn target(&self) -> usize {
        self.target_tokens.unwrap_or(self.max_tokens / 2)
    }

    /// Token count at which auto-optimization fires.
    pub fn trigger_tokens(&self) -> f64 {
        self.max_tokens as f64 * self.optimize_threshold
    }

    /// Items that no strategy may evict or rewrite.
    pub fn is_preserved(&self, item: &ContextItem) -> bool {
        item.item_type == ItemType::UserIntent
            || self.preserve_types.contains(&item.item_type)
            || item.relevance >= PRESERVE_RELEVANCE
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::config("max_tokens must be positive"));
        }
        if self.target() > self.max_tokens {
            return Err(Error::config(format!(
                "target_tokens ({}) exceeds max_tokens ({})",
                self.target(),
                self.max_tokens
            )));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(Error::config("min_relevance must be within [0, 1]"));
        }
        if !(self.optimize_threshold > 0.0 && self.optimize_threshold <= 1.0) {
            return Err(Error::config("optimize_threshold must be within (0, 1]"));
        }
        Ok(())
    }
}
