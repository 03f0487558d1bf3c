//! Working-memory items and the derived views over a session's item set.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode, Result};

/// Default characters per token (conservative estimate for English text and code).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimate the token count of `text` from its byte length.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as usize
}

/// What kind of information an item holds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ItemType {
    #[serde(alias = "user_intent")]
    UserIntent,
    Plan,
    #[serde(alias = "file_content")]
    FileContent,
    Validation,
    Message,
    Architecture,
    #[serde(alias = "tool_result")]
    ToolResult,
    Summary,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::UserIntent => "user-intent",
            ItemType::Plan => "plan",
            ItemType::FileContent => "file-content",
            ItemType::Validation => "validation",
            ItemType::Message => "message",
            ItemType::Architecture => "architecture",
            ItemType::ToolResult => "tool-result",
            ItemType::Summary => "summary",
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority bucket. Hot is kept readily available; Cold is evicted first.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Hot,
    Warm,
    Cold,
}

fn default_relevance() -> f64 {
    1.0
}

/// One unit of working memory.
///
/// `content` and `token_count` are only reachable through accessors so that
/// replacing the content always recomputes the count.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextItem {
    /// Unique within a session. Empty until the manager assigns one.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    content: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    token_count: usize,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default = "default_relevance")]
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ContextItem {
    /// Create an item with an estimated token count and relevance 1.0.
    pub fn new(item_type: ItemType, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: String::new(),
            item_type,
            token_count: estimate_tokens(&content),
            content,
            tier: Tier::Hot,
            last_accessed: None,
            relevance: default_relevance(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Clamped to `[0, 1]`.
    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance.clamp(0.0, 1.0);
        self
    }

    /// Override the estimate with an exact count from a real tokenizer.
    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = tokens;
        self
    }

    pub fn with_last_accessed(mut self, at: DateTime<Utc>) -> Self {
        self.last_accessed = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Replace the content and recompute the token count.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.token_count = estimate_tokens(&self.content);
    }

    /// Fill in a token count for items deserialized without one.
    pub(crate) fn ensure_token_count(&mut self) {
        if self.token_count == 0 && !self.content.is_empty() {
            self.token_count = estimate_tokens(&self.content);
        }
    }
}

/// Sum of `token_count` over `items`.
pub fn total_tokens(items: &[ContextItem]) -> usize {
    items.iter().map(ContextItem::token_count).sum()
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Immutable point-in-time copy of a session's working set.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextSnapshot {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    pub optimization_ratio: f64,
}

impl ContextSnapshot {
    pub fn new(session_id: impl Into<String>, items: Vec<ContextItem>, optimization_ratio: f64) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            total_tokens: total_tokens(&items),
            items,
            optimization_ratio,
        }
    }

    /// Check that `total_tokens` matches the item sum.
    pub fn verify(&self) -> Result<()> {
        let actual = total_tokens(&self.items);
        if actual != self.total_tokens {
            return Err(Error::new(
                ErrorCode::InvalidArguments,
                format!(
                    "snapshot for session {} records {} tokens but items sum to {}",
                    self.session_id, self.total_tokens, actual
                ),
            ));
        }
        Ok(())
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Derived utilization figures for one session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContextMetrics {
    pub current_size: usize,
    pub max_size: usize,
    pub hot_size: usize,
    pub warm_size: usize,
    pub cold_size: usize,
    pub item_count: usize,
    /// `1 - current/max` while under `max_size`, else 0.
    pub efficiency: f64,
    pub optimization_ratio: f64,
    pub last_optimized: Option<DateTime<Utc>>,
}

impl ContextMetrics {
    pub fn compute(
        items: &[ContextItem],
        max_size: usize,
        optimization_ratio: f64,
        last_optimized: Option<DateTime<Utc>>,
    ) -> Self {
        let (mut hot, mut warm, mut cold) = (0, 0, 0);
        for item in items {
            match item.tier {
                Tier::Hot => hot += item.token_count(),
                Tier::Warm => warm += item.token_count(),
                Tier::Cold => cold += item.token_count(),
            }
        }
        let current = hot + warm + cold;
        let efficiency = if max_size > 0 && current < max_size {
            1.0 - current as f64 / max_size as f64
        } else {
            0.0
        };
        Self {
            current_size: current,
            max_size,
            hot_size: hot,
            warm_size: warm,
            cold_size: cold,
            item_count: items.len(),
            efficiency,
            optimization_ratio,
            last_optimized,
        }
    }

    /// Fraction of `max_size` in use.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 1.0;
        }
        self.current_size as f64 / self.max_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(7)), 2);
        assert_eq!(estimate_tokens(&"a".repeat(8)), 3);
    }

    #[test]
    fn set_content_recomputes_tokens() {
        let mut item = ContextItem::new(ItemType::FileContent, "x").with_token_count(5000);
        assert_eq!(item.token_count(), 5000);
        item.set_content("a".repeat(35));
        assert_eq!(item.token_count(), 10);
    }

    #[test]
    fn item_type_accepts_both_spellings() {
        let a: ItemType = serde_json::from_str("\"user-intent\"").unwrap();
        let b: ItemType = serde_json::from_str("\"user_intent\"").unwrap();
        assert_eq!(a, ItemType::UserIntent);
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&ItemType::ToolResult).unwrap(), "\"tool-result\"");
    }

    #[test]
    fn deserialized_item_gets_defaults() {
        let mut item: ContextItem =
            serde_json::from_str(r#"{"type":"plan","content":"do the thing"}"#).unwrap();
        assert_eq!(item.relevance, 1.0);
        assert_eq!(item.token_count(), 0);
        item.ensure_token_count();
        assert_eq!(item.token_count(), estimate_tokens("do the thing"));
    }

    #[test]
    fn snapshot_verify_detects_mismatch() {
        let items = vec![
            ContextItem::new(ItemType::Plan, "a").with_token_count(10),
            ContextItem::new(ItemType::Plan, "b").with_token_count(15),
        ];
        let mut snap = ContextSnapshot::new("s1", items, 1.0);
        assert_eq!(snap.total_tokens, 25);
        assert!(snap.verify().is_ok());
        snap.total_tokens = 24;
        assert!(snap.verify().is_err());
    }

    #[test]
    fn metrics_tier_sizes_sum_to_current() {
        let mut cold = ContextItem::new(ItemType::Message, "c").with_token_count(30);
        cold.tier = Tier::Cold;
        let mut warm = ContextItem::new(ItemType::Message, "w").with_token_count(20);
        warm.tier = Tier::Warm;
        let hot = ContextItem::new(ItemType::Message, "h").with_token_count(50);
        let m = ContextMetrics::compute(&[hot, warm, cold], 200, 1.0, None);
        assert_eq!(m.current_size, 100);
        assert_eq!(m.hot_size + m.warm_size + m.cold_size, m.current_size);
        assert!((m.efficiency - 0.5).abs() < 1e-9);
        assert!((m.utilization() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn efficiency_is_zero_at_or_over_max() {
        let item = ContextItem::new(ItemType::Message, "h").with_token_count(300);
        let m = ContextMetrics::compute(&[item], 200, 1.0, None);
        assert_eq!(m.efficiency, 0.0);
    }
}
