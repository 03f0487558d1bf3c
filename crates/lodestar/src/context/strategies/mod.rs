//! Interchangeable algorithms that shrink a session's working set.
//!
//! | Strategy | Effect |
//! |----------|--------|
//! | [`SelectivePruning`] | Keeps preserved items, admits the rest by score until the target is reached |
//! | [`AggressiveSummarization`] | Rewrites large non-preserved items as summaries at half size |
//! | [`SemanticChunking`] | Per item type, keeps preserved items and those at or above the relevance floor |
//! | [`TieredEviction`] | Relabels Hot/Warm/Cold tiers without removing anything |
//! | [`Balanced`] | Tiering, then pruning, then summarization, each only while still over target |
//!
//! Every strategy takes the current list and returns its replacement. A list
//! already at or under the target comes back with its content untouched.

mod balanced;
mod chunking;
mod pruning;
mod summarization;
mod tiered;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::config::{OptimizationConfig, StrategyKind};
use super::item::ContextItem;
use super::summarizer::Summarizer;
use crate::error::Result;

pub use balanced::Balanced;
pub use chunking::SemanticChunking;
pub use pruning::SelectivePruning;
pub use summarization::AggressiveSummarization;
pub use tiered::TieredEviction;

/// A context optimization algorithm.
#[async_trait]
pub trait OptimizationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Produce the replacement working set. `now` anchors recency scoring.
    async fn optimize(
        &self,
        items: Vec<ContextItem>,
        config: &OptimizationConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>>;
}

/// Build the strategy for `kind`. Summarizing strategies use `summarizer`.
pub fn strategy_for(
    kind: StrategyKind,
    summarizer: Arc<dyn Summarizer>,
) -> Box<dyn OptimizationStrategy> {
    match kind {
        StrategyKind::SelectivePruning => Box::new(SelectivePruning),
        StrategyKind::AggressiveSummarization => Box::new(AggressiveSummarization::new(summarizer)),
        StrategyKind::SemanticChunking => Box::new(SemanticChunking),
        StrategyKind::TieredEviction => Box::new(TieredEviction),
        StrategyKind::Balanced => Box::new(Balanced::new(summarizer)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::item::ItemType;

    pub fn item(id: &str, item_type: ItemType, relevance: f64, tokens: usize) -> ContextItem {
        ContextItem::new(item_type, format!("content of {id}"))
            .with_id(id)
            .with_relevance(relevance)
            .with_token_count(tokens)
    }

    pub fn ids(items: &[ContextItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }
}
