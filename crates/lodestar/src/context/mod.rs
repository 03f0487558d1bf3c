//! Tiered working memory: scored items, tier allocation and optimization.
//!
//! The context window is the scarcest resource in a long-running agent. This
//! module keeps each session's working set under a token budget:
//!
//! 1. **[`item`]**: [`ContextItem`]s carry a type, a token count and an
//!    explicit relevance. [`ContextSnapshot`] and [`ContextMetrics`] are the
//!    derived views.
//!
//! 2. **[`scoring`]**: blends relevance with time-decayed recency into a
//!    composite score, and assigns Hot/Warm/Cold tiers against the budget.
//!
//! 3. **[`strategies`]**: five interchangeable ways to shrink a working set
//!    to its target size, selected by [`StrategyKind`].
//!
//! 4. **[`manager`]**: [`ContextManager`] owns one working set per session,
//!    auto-optimizes past a utilization threshold, and snapshots/restores.
//!
//! Summarizing strategies call out through the [`Summarizer`] trait.

pub mod config;
pub mod item;
pub mod manager;
pub mod scoring;
pub mod strategies;
pub mod summarizer;

pub use config::{OptimizationConfig, StrategyKind};
pub use item::{
    ContextItem, ContextMetrics, ContextSnapshot, DEFAULT_CHARS_PER_TOKEN, ItemType, Tier,
    estimate_tokens,
};
pub use manager::ContextManager;
pub use scoring::{allocate_tiers, composite_score, rank};
pub use strategies::{OptimizationStrategy, strategy_for};
pub use summarizer::{CompletionSummarizer, Summarizer, TruncatingSummarizer};
