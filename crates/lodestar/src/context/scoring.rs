//! Composite relevance scoring and Hot/Warm/Cold tier allocation.
//!
//! The composite score blends an item's explicit `relevance` with a recency
//! term that decays on a 24-hour scale:
//!
//! ```text
//! recency   = 1 / (1 + hours_since_last_access / 24)
//! composite = 0.7 * relevance + 0.3 * recency
//! ```
//!
//! Every ranking step in the crate goes through [`rank`], which is a stable
//! sort: equal scores keep their insertion order.

use chrono::{DateTime, Utc};

use super::config::OptimizationConfig;
use super::item::{ContextItem, Tier};

const RELEVANCE_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;
const RECENCY_HALF_SCALE_HOURS: f64 = 24.0;

/// Recency term in `(0, 1]`. Items never accessed count as accessed `now`.
pub fn recency(item: &ContextItem, now: DateTime<Utc>) -> f64 {
    let Some(last) = item.last_accessed else {
        return 1.0;
    };
    let hours = (now - last).num_milliseconds().max(0) as f64 / 3_600_000.0;
    1.0 / (1.0 + hours / RECENCY_HALF_SCALE_HOURS)
}

pub fn composite_score(item: &ContextItem, now: DateTime<Utc>) -> f64 {
    item.relevance * RELEVANCE_WEIGHT + recency(item, now) * RECENCY_WEIGHT
}

/// Indices of `items` ordered by descending composite score.
pub fn rank(items: &[ContextItem], now: DateTime<Utc>) -> Vec<usize> {
    let scores: Vec<f64> = items.iter().map(|i| composite_score(i, now)).collect();
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

/// Relabel tiers in place.
///
/// Walks items by descending score with a running token total: up to
/// `max_tokens / 4` is Hot, up to `max_tokens / 2` is Warm, the rest Cold.
/// Preserved items are always Hot and their tokens still count toward the
/// running total, so they may push the Hot allotment over budget.
pub fn allocate_tiers(items: &mut [ContextItem], config: &OptimizationConfig, now: DateTime<Utc>) {
    let hot_limit = config.max_tokens / 4;
    let warm_limit = config.max_tokens / 2;
    let mut cumulative = 0usize;

    for idx in rank(items, now) {
        let preserved = config.is_preserved(&items[idx]);
        let item = &mut items[idx];
        cumulative += item.token_count();
        item.tier = if preserved || cumulative <= hot_limit {
            Tier::Hot
        } else if cumulative <= warm_limit {
            Tier::Warm
        } else {
            Tier::Cold
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::item::ItemType;
    use chrono::Duration;

    fn item(relevance: f64, tokens: usize) -> ContextItem {
        ContextItem::new(ItemType::Message, "x")
            .with_relevance(relevance)
            .with_token_count(tokens)
    }

    #[test]
    fn recency_decays_on_day_scale() {
        let now = Utc::now();
        let fresh = item(0.5, 1).with_last_accessed(now);
        let day_old = item(0.5, 1).with_last_accessed(now - Duration::hours(24));
        assert!((recency(&fresh, now) - 1.0).abs() < 1e-9);
        assert!((recency(&day_old, now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn composite_weights_relevance_and_recency() {
        let now = Utc::now();
        let it = item(1.0, 1).with_last_accessed(now - Duration::hours(72));
        // 0.7 * 1.0 + 0.3 * 0.25
        assert!((composite_score(&it, now) - 0.775).abs() < 1e-9);
    }

    #[test]
    fn future_timestamps_do_not_exceed_full_recency() {
        let now = Utc::now();
        let it = item(0.0, 1).with_last_accessed(now + Duration::hours(5));
        assert_eq!(recency(&it, now), 1.0);
    }

    #[test]
    fn rank_orders_descending() {
        let now = Utc::now();
        let items = vec![item(0.2, 1), item(0.8, 1), item(0.5, 1)];
        assert_eq!(rank(&items, now), vec![1, 2, 0]);
    }

    #[test]
    fn equal_scores_keep_insertion_order() {
        let now = Utc::now();
        let at = now - Duration::hours(3);
        let items: Vec<_> = (0..6)
            .map(|i| item(0.4, 10).with_id(format!("i{i}")).with_last_accessed(at))
            .collect();
        assert_eq!(rank(&items, now), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn tiers_follow_cumulative_budget() {
        let now = Utc::now();
        let cfg = OptimizationConfig::with_max_tokens(1000);
        let mut items = vec![item(0.8, 200), item(0.7, 200), item(0.6, 200), item(0.5, 200)];
        allocate_tiers(&mut items, &cfg, now);
        let tiers: Vec<Tier> = items.iter().map(|i| i.tier).collect();
        assert_eq!(tiers, vec![Tier::Hot, Tier::Warm, Tier::Cold, Tier::Cold]);
    }

    #[test]
    fn preserved_items_forced_hot_and_counted() {
        let now = Utc::now();
        let cfg = OptimizationConfig::with_max_tokens(1000);
        let mut items = vec![
            ContextItem::new(ItemType::UserIntent, "goal")
                .with_relevance(0.1)
                .with_token_count(600),
            item(0.85, 100),
        ];
        allocate_tiers(&mut items, &cfg, now);
        // The message outranks the low-relevance intent.
        assert_eq!(items[1].tier, Tier::Hot);
        // Intent runs the total to 700 but stays hot.
        assert_eq!(items[0].tier, Tier::Hot);

        let mut items = vec![
            ContextItem::new(ItemType::Architecture, "arch")
                .with_relevance(1.0)
                .with_token_count(600),
            item(0.85, 100),
        ];
        allocate_tiers(&mut items, &cfg, now);
        assert_eq!(items[0].tier, Tier::Hot);
        // 700 cumulative is past the warm limit of 500.
        assert_eq!(items[1].tier, Tier::Cold);
    }
}
