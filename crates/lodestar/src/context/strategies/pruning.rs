use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::OptimizationStrategy;
use crate::context::config::{OptimizationConfig, StrategyKind};
use crate::context::item::{ContextItem, total_tokens};
use crate::context::scoring::rank;
use crate::error::Result;

/// Drops the lowest-scoring removable items until the set fits the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectivePruning;

#[async_trait]
impl OptimizationStrategy for SelectivePruning {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SelectivePruning
    }

    async fn optimize(
        &self,
        items: Vec<ContextItem>,
        config: &OptimizationConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>> {
        Ok(prune(items, config, now))
    }
}

/// Preserved items always survive and are counted first, wherever they rank.
/// The remaining items are admitted in score order until the next one would
/// push the total past the target; admission stops there. Counting preserved
/// tokens up front means the admitted total never overshoots the target, so
/// the result is either within target or holds only preserved items.
/// Survivors keep their original relative order.
pub(crate) fn prune(
    items: Vec<ContextItem>,
    config: &OptimizationConfig,
    now: DateTime<Utc>,
) -> Vec<ContextItem> {
    let target = config.target();
    let before = total_tokens(&items);
    if before <= target {
        return items;
    }

    let preserved: Vec<bool> = items.iter().map(|i| config.is_preserved(i)).collect();
    let mut keep = preserved.clone();
    let mut running: usize = items
        .iter()
        .zip(&preserved)
        .filter(|(_, p)| **p)
        .map(|(i, _)| i.token_count())
        .sum();

    for idx in rank(&items, now) {
        if preserved[idx] {
            continue;
        }
        let tokens = items[idx].token_count();
        if running + tokens > target {
            break;
        }
        keep[idx] = true;
        running += tokens;
    }

    let kept: Vec<ContextItem> = items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then_some(item))
        .collect();
    debug!(
        "Selective pruning: {} -> {} tokens (target {}), {} items kept",
        before,
        running,
        target,
        kept.len()
    );
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::item::ItemType;
    use crate::context::strategies::test_support::{ids, item};

    fn config(max: usize, target: usize, min: f64) -> OptimizationConfig {
        OptimizationConfig::with_max_tokens(max)
            .with_target_tokens(target)
            .with_min_relevance(min)
            .with_strategy(StrategyKind::SelectivePruning)
    }

    #[tokio::test]
    async fn drops_lowest_relevance_to_fit_target() {
        let items = vec![
            item("intent", ItemType::UserIntent, 0.9, 200),
            item("mid", ItemType::Message, 0.6, 200),
            item("low", ItemType::Message, 0.3, 200),
        ];
        let out = SelectivePruning
            .optimize(items, &config(1000, 500, 0.5), Utc::now())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["intent", "mid"]);
        assert_eq!(total_tokens(&out), 400);
    }

    #[tokio::test]
    async fn under_target_is_untouched() {
        let items = vec![
            item("a", ItemType::Message, 0.1, 100),
            item("b", ItemType::Message, 0.2, 100),
        ];
        let out = SelectivePruning
            .optimize(items.clone(), &config(1000, 500, 0.5), Utc::now())
            .await
            .unwrap();
        assert_eq!(out, items);
    }

    #[tokio::test]
    async fn stops_admitting_at_first_item_that_overflows() {
        let items = vec![
            item("big", ItemType::Message, 0.8, 400),
            item("huge", ItemType::Message, 0.7, 300),
            item("small", ItemType::Message, 0.6, 50),
        ];
        let out = SelectivePruning
            .optimize(items, &config(1000, 500, 0.0), Utc::now())
            .await
            .unwrap();
        // "huge" overflows, and admission stops before "small".
        assert_eq!(ids(&out), vec!["big"]);
    }

    #[tokio::test]
    async fn preserved_items_survive_even_over_target() {
        let items = vec![
            item("arch", ItemType::Architecture, 0.2, 600),
            item("msg", ItemType::Message, 0.8, 100),
        ];
        let out = SelectivePruning
            .optimize(items, &config(1000, 500, 0.5), Utc::now())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["arch"]);
        assert_eq!(out[0].content(), "content of arch");
    }

    #[tokio::test]
    async fn low_ranked_preserved_item_still_reserves_its_tokens() {
        let items = vec![
            item("msg", ItemType::Message, 0.8, 300),
            item("arch", ItemType::Architecture, 0.1, 300),
        ];
        let out = SelectivePruning
            .optimize(items, &config(1000, 500, 0.5), Utc::now())
            .await
            .unwrap();
        // "msg" outranks "arch", but admitting it would overshoot once the
        // preserved tokens are counted.
        assert_eq!(ids(&out), vec!["arch"]);
        assert_eq!(total_tokens(&out), 300);
    }

    #[tokio::test]
    async fn survivors_keep_original_order() {
        let items = vec![
            item("c", ItemType::Message, 0.3, 100),
            item("a", ItemType::Message, 0.8, 100),
            item("b", ItemType::Message, 0.7, 100),
            item("d", ItemType::Message, 0.1, 400),
        ];
        let out = SelectivePruning
            .optimize(items, &config(1000, 300, 0.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["c", "a", "b"]);
    }
}
