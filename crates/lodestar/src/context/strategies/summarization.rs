use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::OptimizationStrategy;
use crate::context::config::{OptimizationConfig, StrategyKind};
use crate::context::item::{ContextItem, ItemType, total_tokens};
use crate::context::summarizer::Summarizer;
use crate::error::Result;

/// Items at or below this size are never summarized.
pub const SUMMARIZE_MIN_TOKENS: usize = 1000;

/// Fraction of the original size a summary aims for.
pub const SUMMARY_TARGET_RATIO: f64 = 0.5;

/// Rewrites every large, non-preserved, not-yet-summarized item as a summary.
pub struct AggressiveSummarization {
    summarizer: Arc<dyn Summarizer>,
}

impl AggressiveSummarization {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }
}

#[async_trait]
impl OptimizationStrategy for AggressiveSummarization {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AggressiveSummarization
    }

    async fn optimize(
        &self,
        items: Vec<ContextItem>,
        config: &OptimizationConfig,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ContextItem>> {
        if total_tokens(&items) <= config.target() {
            return Ok(items);
        }
        Ok(summarize_items(items, config, self.summarizer.as_ref()).await)
    }
}

fn is_summarizable(item: &ContextItem, config: &OptimizationConfig) -> bool {
    item.token_count() > SUMMARIZE_MIN_TOKENS
        && item.item_type != ItemType::Summary
        && !config.is_preserved(item)
}

/// Summarize each eligible item in place. A failed summary leaves the
/// original item as it was.
pub(crate) async fn summarize_items(
    mut items: Vec<ContextItem>,
    config: &OptimizationConfig,
    summarizer: &dyn Summarizer,
) -> Vec<ContextItem> {
    let mut summarized = 0usize;
    for item in items.iter_mut() {
        if !is_summarizable(item, config) {
            continue;
        }
        let original_tokens = item.token_count();
        let target = (original_tokens as f64 * SUMMARY_TARGET_RATIO) as usize;
        match summarizer.summarize(item.content(), target).await {
            Ok(summary) => {
                let original_type = item.item_type;
                item.set_content(summary);
                item.item_type = ItemType::Summary;
                let ratio = item.token_count() as f64 / original_tokens as f64;
                item.metadata
                    .insert("original_tokens".into(), json!(original_tokens));
                item.metadata.insert("compression_ratio".into(), json!(ratio));
                item.metadata
                    .insert("original_type".into(), json!(original_type.as_str()));
                summarized += 1;
            }
            Err(e) => {
                warn!(
                    "Summarization of item {} failed, keeping original: {}",
                    item.id, e
                );
            }
        }
    }
    debug!("Aggressive summarization rewrote {} item(s)", summarized);
    items
}
