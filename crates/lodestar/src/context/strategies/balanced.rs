use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::OptimizationStrategy;
use super::pruning::prune;
use super::summarization::summarize_items;
use crate::context::config::{OptimizationConfig, StrategyKind};
use crate::context::item::{ContextItem, total_tokens};
use crate::context::scoring::allocate_tiers;
use crate::context::summarizer::Summarizer;
use crate::error::Result;

/// Default pipeline: tier, then prune, then summarize.
///
/// Each stage runs on the previous stage's output and only while the set is
/// still over target. Tiers are reassigned once more at the end because
/// pruning and summarization change the cumulative totals.
pub struct Balanced {
    summarizer: Arc<dyn Summarizer>,
}

impl Balanced {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }
}

#[async_trait]
impl OptimizationStrategy for Balanced {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Balanced
    }

    async fn optimize(
        &self,
        mut items: Vec<ContextItem>,
        config: &OptimizationConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>> {
        let target = config.target();
        allocate_tiers(&mut items, config, now);
        if total_tokens(&items) <= target {
            return Ok(items);
        }

        let mut items = prune(items, config, now);
        debug!("Balanced: {} tokens after pruning", total_tokens(&items));

        if total_tokens(&items) > target {
            items = summarize_items(items, config, self.summarizer.as_ref()).await;
            debug!("Balanced: {} tokens after summarization", total_tokens(&items));
        }

        allocate_tiers(&mut items, config, now);
        Ok(items)
    }
}
