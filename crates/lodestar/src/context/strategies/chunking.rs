use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::OptimizationStrategy;
use crate::context::config::{OptimizationConfig, StrategyKind};
use crate::context::item::{ContextItem, ItemType, total_tokens};
use crate::context::scoring::rank;
use crate::error::Result;

/// Filters each item type independently against the relevance floor.
///
/// Output is grouped by type in order of first appearance, each group ranked
/// by composite score. One type's occupancy never affects another's.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticChunking;

#[async_trait]
impl OptimizationStrategy for SemanticChunking {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SemanticChunking
    }

    async fn optimize(
        &self,
        items: Vec<ContextItem>,
        config: &OptimizationConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>> {
        let before = total_tokens(&items);
        if before <= config.target() {
            return Ok(items);
        }

        let mut groups: Vec<(ItemType, Vec<ContextItem>)> = Vec::new();
        for item in items {
            match groups.iter_mut().find(|(t, _)| *t == item.item_type) {
                Some((_, group)) => group.push(item),
                None => groups.push((item.item_type, vec![item])),
            }
        }

        let mut out = Vec::new();
        for (item_type, group) in groups {
            let order = rank(&group, now);
            let mut slots: Vec<Option<ContextItem>> = group.into_iter().map(Some).collect();
            let mut kept = 0usize;
            for idx in order {
                if let Some(item) = slots[idx].take()
                    && (config.is_preserved(&item) || item.relevance >= config.min_relevance)
                {
                    out.push(item);
                    kept += 1;
                }
            }
            debug!("Semantic chunking: kept {} {} item(s)", kept, item_type);
        }

        debug!(
            "Semantic chunking: {} -> {} tokens",
            before,
            total_tokens(&out)
        );
        Ok(out)
    }
}
