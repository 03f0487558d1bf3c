use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::OptimizationStrategy;
use crate::context::config::{OptimizationConfig, StrategyKind};
use crate::context::item::ContextItem;
use crate::context::scoring::allocate_tiers;
use crate::error::Result;

/// Re-runs tier allocation. Never removes an item.
#[derive(Debug, Clone, Copy, Default)]
pub struct TieredEviction;

#[async_trait]
impl OptimizationStrategy for TieredEviction {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TieredEviction
    }

    async fn optimize(
        &self,
        mut items: Vec<ContextItem>,
        config: &OptimizationConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>> {
        allocate_tiers(&mut items, config, now);
        Ok(items)
    }
}
