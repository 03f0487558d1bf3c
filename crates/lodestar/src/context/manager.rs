//! Per-session working-set ownership.
//!
//! The session map itself sits behind a short-lived std `RwLock` used only to
//! look up, insert or remove sessions. Each session's state has its own
//! async `RwLock`, so unrelated sessions never serialize on each other and an
//! optimization pass (which may await a summarizer) holds only its own
//! session's lock for its whole duration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::config::OptimizationConfig;
use super::item::{ContextItem, ContextMetrics, ContextSnapshot, ItemType, total_tokens};
use super::scoring::rank;
use super::strategies::strategy_for;
use super::summarizer::{Summarizer, TruncatingSummarizer};
use crate::error::{Error, ErrorCode, Result};

/// One session's working set and bookkeeping.
#[derive(Debug)]
struct SessionContext {
    config: OptimizationConfig,
    items: Vec<ContextItem>,
    metrics: ContextMetrics,
    optimization_ratio: f64,
    last_optimized: Option<DateTime<Utc>>,
}

impl SessionContext {
    fn new(config: OptimizationConfig) -> Self {
        let metrics = ContextMetrics::compute(&[], config.max_tokens, 1.0, None);
        Self {
            config,
            items: Vec::new(),
            metrics,
            optimization_ratio: 1.0,
            last_optimized: None,
        }
    }

    fn refresh_metrics(&mut self) {
        self.metrics = ContextMetrics::compute(
            &self.items,
            self.config.max_tokens,
            self.optimization_ratio,
            self.last_optimized,
        );
    }

    fn should_auto_optimize(&self) -> bool {
        self.config.auto_optimize
            && self.metrics.current_size as f64 >= self.config.trigger_tokens()
    }
}

type SessionHandle = Arc<tokio::sync::RwLock<SessionContext>>;

/// Owns every session's in-memory working set.
pub struct ContextManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    default_config: OptimizationConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextManager {
    /// New sessions use `default_config`. Summarizing strategies fall back to
    /// [`TruncatingSummarizer`] until [`with_summarizer`](Self::with_summarizer)
    /// installs a real one.
    pub fn new(default_config: OptimizationConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_config,
            summarizer: Arc::new(TruncatingSummarizer),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn default_config(&self) -> &OptimizationConfig {
        &self.default_config
    }

    fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn session_or_create(&self, session_id: &str) -> SessionHandle {
        if let Some(handle) = self.session(session_id) {
            return handle;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("Creating context for session {}", session_id);
                Arc::new(tokio::sync::RwLock::new(SessionContext::new(
                    self.default_config.clone(),
                )))
            })
            .clone()
    }

    fn require_session(&self, session_id: &str) -> Result<SessionHandle> {
        self.session(session_id)
            .ok_or_else(|| Error::unknown_session(session_id))
    }

    /// Set the policy for a session, creating it if needed.
    pub async fn configure_session(&self, session_id: &str, config: OptimizationConfig) -> Result<()> {
        config.validate()?;
        let handle = self.session_or_create(session_id);
        let mut ctx = handle.write().await;
        ctx.config = config;
        ctx.refresh_metrics();
        Ok(())
    }

    /// Append an item, creating the session on first use.
    ///
    /// Assigns an id and `last_accessed` when missing. When auto-optimization
    /// is on and utilization reaches the threshold, the configured strategy
    /// runs before this returns, under the same exclusive lock. Returns the
    /// id of the stored item.
    pub async fn add_item(&self, session_id: &str, mut item: ContextItem) -> Result<String> {
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }
        if item.last_accessed.is_none() {
            item.last_accessed = Some(Utc::now());
        }
        item.relevance = item.relevance.clamp(0.0, 1.0);
        item.ensure_token_count();

        let handle = self.session_or_create(session_id);
        let mut ctx = handle.write().await;
        if ctx.items.iter().any(|i| i.id == item.id) {
            return Err(Error::new(
                ErrorCode::DuplicateItem,
                format!("item {} already exists in session {}", item.id, session_id),
            ));
        }
        let id = item.id.clone();
        debug!(
            "Adding {} item {} ({} tokens) to session {}",
            item.item_type,
            id,
            item.token_count(),
            session_id
        );
        ctx.items.push(item);
        ctx.refresh_metrics();

        if ctx.should_auto_optimize() {
            info!(
                "Session {} at {:.0}% of {} tokens, optimizing",
                session_id,
                ctx.metrics.utilization() * 100.0,
                ctx.config.max_tokens
            );
            self.optimize_locked(session_id, &mut ctx).await?;
        }
        Ok(id)
    }

    /// Convenience wrapper around [`add_item`](Self::add_item).
    pub async fn add_text(
        &self,
        session_id: &str,
        item_type: ItemType,
        content: impl Into<String>,
        relevance: f64,
    ) -> Result<String> {
        self.add_item(session_id, ContextItem::new(item_type, content).with_relevance(relevance))
            .await
    }

    /// Highest-scoring items that fit in `max_tokens`.
    ///
    /// Selection is greedy by descending composite score and stops at the
    /// first item that would overflow. Returned items get `last_accessed`
    /// stamped, which is a mutation, so this takes the exclusive lock.
    /// Unknown sessions yield an empty list.
    pub async fn get_context(&self, session_id: &str, max_tokens: usize) -> Vec<ContextItem> {
        let Some(handle) = self.session(session_id) else {
            return Vec::new();
        };
        let mut ctx = handle.write().await;
        let now = Utc::now();
        let mut selected = Vec::new();
        let mut used = 0usize;
        for idx in rank(&ctx.items, now) {
            let tokens = ctx.items[idx].token_count();
            if used + tokens > max_tokens {
                break;
            }
            used += tokens;
            let item = &mut ctx.items[idx];
            item.last_accessed = Some(now);
            selected.push(item.clone());
        }
        selected
    }

    /// Render selected context as plain text for a prompt.
    pub async fn render_context(&self, session_id: &str, max_tokens: usize) -> Option<String> {
        let items = self.get_context(session_id, max_tokens).await;
        if items.is_empty() {
            return None;
        }
        let body: Vec<String> = items
            .iter()
            .map(|i| format!("[{}] {}", i.item_type, i.content()))
            .collect();
        Some(body.join("\n\n"))
    }

    pub async fn get_metrics(&self, session_id: &str) -> Result<ContextMetrics> {
        let handle = self.require_session(session_id)?;
        let ctx = handle.read().await;
        Ok(ctx.metrics.clone())
    }

    /// Run the session's configured strategy and replace its working set.
    pub async fn optimize_context(&self, session_id: &str) -> Result<ContextMetrics> {
        let handle = self.require_session(session_id)?;
        let mut ctx = handle.write().await;
        self.optimize_locked(session_id, &mut ctx).await?;
        Ok(ctx.metrics.clone())
    }

    async fn optimize_locked(&self, session_id: &str, ctx: &mut SessionContext) -> Result<()> {
        let before = total_tokens(&ctx.items);
        let strategy = strategy_for(ctx.config.strategy, self.summarizer.clone());
        let items = std::mem::take(&mut ctx.items);
        let now = Utc::now();
        let result = strategy.optimize(items.clone(), &ctx.config, now).await;
        let optimized = match result {
            Ok(optimized) => optimized,
            Err(e) => {
                ctx.items = items;
                return Err(e.context(format!("optimizing session {session_id}")));
            }
        };
        let after = total_tokens(&optimized);
        ctx.items = optimized;
        ctx.optimization_ratio = if before == 0 {
            1.0
        } else {
            after as f64 / before as f64
        };
        ctx.last_optimized = Some(now);
        ctx.refresh_metrics();
        info!(
            "Optimized session {} with {}: {} -> {} tokens ({} items)",
            session_id,
            ctx.config.strategy,
            before,
            after,
            ctx.items.len()
        );
        Ok(())
    }

    /// Deep copy of the session's working set.
    pub async fn create_snapshot(&self, session_id: &str) -> Result<ContextSnapshot> {
        let handle = self.require_session(session_id)?;
        let ctx = handle.read().await;
        Ok(ContextSnapshot::new(
            session_id,
            ctx.items.clone(),
            ctx.optimization_ratio,
        ))
    }

    /// Replace the session's state with `snapshot`, creating the session if
    /// it does not exist.
    pub async fn restore_snapshot(&self, session_id: &str, snapshot: &ContextSnapshot) -> Result<()> {
        snapshot.verify()?;
        let handle = self.session_or_create(session_id);
        let mut ctx = handle.write().await;
        ctx.items = snapshot.items.clone();
        ctx.optimization_ratio = snapshot.optimization_ratio;
        ctx.refresh_metrics();
        info!(
            "Restored session {} from snapshot of {} ({} items, {} tokens)",
            session_id,
            snapshot.session_id,
            snapshot.items.len(),
            snapshot.total_tokens
        );
        Ok(())
    }

    /// Drop all state for a session. Returns whether it existed.
    pub async fn clear_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        match removed {
            Some(handle) => {
                // Wait out any in-flight mutation before reporting the clear.
                let mut ctx = handle.write().await;
                ctx.items.clear();
                ctx.refresh_metrics();
                debug!("Cleared session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::config::StrategyKind;
    use crate::context::item::Tier;

    fn manual(max: usize) -> ContextManager {
        ContextManager::new(OptimizationConfig::with_max_tokens(max).with_auto_optimize(false))
    }

    fn sized(item_type: ItemType, relevance: f64, tokens: usize) -> ContextItem {
        ContextItem::new(item_type, "payload")
            .with_relevance(relevance)
            .with_token_count(tokens)
    }

    #[tokio::test]
    async fn add_item_assigns_id_and_timestamp() {
        let mgr = manual(1000);
        let id = mgr
            .add_item("s", ContextItem::new(ItemType::Plan, "step 1"))
            .await
            .unwrap();
        assert!(!id.is_empty());
        let items = mgr.get_context("s", 1000).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert!(items[0].last_accessed.is_some());
        assert_eq!(items[0].relevance, 1.0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let mgr = manual(1000);
        let item = ContextItem::new(ItemType::Plan, "x").with_id("fixed");
        mgr.add_item("s", item.clone()).await.unwrap();
        let err = mgr.add_item("s", item).await.unwrap_err();
        assert!(err.is(ErrorCode::DuplicateItem));
    }

    #[tokio::test]
    async fn get_context_is_greedy_and_stops_at_first_overflow() {
        let mgr = manual(10_000);
        mgr.add_item("s", sized(ItemType::Message, 0.9, 300).with_id("a")).await.unwrap();
        mgr.add_item("s", sized(ItemType::Message, 0.8, 500).with_id("b")).await.unwrap();
        mgr.add_item("s", sized(ItemType::Message, 0.7, 100).with_id("c")).await.unwrap();

        let items = mgr.get_context("s", 700).await;
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        // "b" would overflow; "c" would fit but selection has stopped.
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn get_context_unknown_session_is_empty() {
        let mgr = manual(100);
        assert!(mgr.get_context("nope", 100).await.is_empty());
    }

    #[tokio::test]
    async fn get_context_stamps_only_returned_items() {
        let mgr = manual(10_000);
        let old = Utc::now() - chrono::Duration::hours(48);
        mgr.add_item("s", sized(ItemType::Message, 0.9, 100).with_id("hit").with_last_accessed(old))
            .await
            .unwrap();
        mgr.add_item("s", sized(ItemType::Message, 0.1, 900).with_id("miss").with_last_accessed(old))
            .await
            .unwrap();
        mgr.get_context("s", 500).await;
        let snap = mgr.create_snapshot("s").await.unwrap();
        let hit = snap.items.iter().find(|i| i.id == "hit").unwrap();
        let miss = snap.items.iter().find(|i| i.id == "miss").unwrap();
        assert!(hit.last_accessed.unwrap() > old);
        assert_eq!(miss.last_accessed, Some(old));
    }

    #[tokio::test]
    async fn optimize_unknown_session_fails() {
        let mgr = manual(100);
        let err = mgr.optimize_context("ghost").await.unwrap_err();
        assert!(err.is(ErrorCode::UnknownSession));
        assert!(mgr.get_metrics("ghost").await.is_err());
        assert!(mgr.create_snapshot("ghost").await.is_err());
    }

    #[tokio::test]
    async fn auto_optimize_fires_at_threshold() {
        let cfg = OptimizationConfig::with_max_tokens(1000)
            .with_strategy(StrategyKind::SelectivePruning)
            .with_min_relevance(0.5);
        let mgr = ContextManager::new(cfg);
        mgr.add_item("s", sized(ItemType::UserIntent, 0.9, 300)).await.unwrap();
        mgr.add_item("s", sized(ItemType::Message, 0.6, 200)).await.unwrap();
        assert_eq!(mgr.get_metrics("s").await.unwrap().current_size, 500);
        assert!(mgr.get_metrics("s").await.unwrap().last_optimized.is_none());

        // 800 / 1000 reaches the 0.8 threshold.
        mgr.add_item("s", sized(ItemType::Message, 0.3, 300)).await.unwrap();
        let m = mgr.get_metrics("s").await.unwrap();
        assert!(m.last_optimized.is_some());
        assert_eq!(m.current_size, 500);
        assert!((m.optimization_ratio - 500.0 / 800.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metrics_track_tiers_after_optimization() {
        let cfg = OptimizationConfig::with_max_tokens(1000)
            .with_strategy(StrategyKind::TieredEviction)
            .with_auto_optimize(false);
        let mgr = ContextManager::new(cfg);
        for r in [0.8, 0.7, 0.6] {
            mgr.add_item("s", sized(ItemType::Message, r, 200)).await.unwrap();
        }
        let m = mgr.optimize_context("s").await.unwrap();
        assert_eq!(m.hot_size, 200);
        assert_eq!(m.warm_size, 200);
        assert_eq!(m.cold_size, 200);
        assert_eq!(m.item_count, 3);
    }

    #[tokio::test]
    async fn snapshot_restore_replaces_state() {
        let mgr = manual(1000);
        mgr.add_item("s", sized(ItemType::Plan, 0.5, 10).with_id("p")).await.unwrap();
        let snap = mgr.create_snapshot("s").await.unwrap();
        assert_eq!(snap.total_tokens, 10);

        mgr.add_item("s", sized(ItemType::Message, 0.5, 40)).await.unwrap();
        assert_eq!(mgr.get_metrics("s").await.unwrap().current_size, 50);

        mgr.restore_snapshot("s", &snap).await.unwrap();
        let m = mgr.get_metrics("s").await.unwrap();
        assert_eq!(m.current_size, 10);
        assert_eq!(m.item_count, 1);

        // Restoring into a fresh session creates it.
        mgr.restore_snapshot("copy", &snap).await.unwrap();
        assert_eq!(mgr.get_metrics("copy").await.unwrap().current_size, 10);
    }

    #[tokio::test]
    async fn snapshot_is_a_deep_copy() {
        let mgr = manual(1000);
        mgr.add_item("s", sized(ItemType::Plan, 0.5, 10).with_id("p")).await.unwrap();
        let snap = mgr.create_snapshot("s").await.unwrap();
        mgr.clear_session("s").await;
        assert_eq!(snap.items.len(), 1);
        assert_eq!(snap.items[0].tier, Tier::Hot);
    }

    #[tokio::test]
    async fn clear_session_removes_state() {
        let mgr = manual(1000);
        mgr.add_item("a", sized(ItemType::Plan, 0.5, 10)).await.unwrap();
        mgr.add_item("b", sized(ItemType::Plan, 0.5, 10)).await.unwrap();
        assert_eq!(mgr.session_ids(), vec!["a", "b"]);
        assert!(mgr.clear_session("a").await);
        assert!(!mgr.clear_session("a").await);
        assert_eq!(mgr.session_ids(), vec!["b"]);
        assert!(mgr.get_metrics("a").await.is_err());
    }

    #[tokio::test]
    async fn configure_session_validates() {
        let mgr = manual(1000);
        let bad = OptimizationConfig::with_max_tokens(10).with_target_tokens(20);
        assert!(mgr.configure_session("s", bad).await.is_err());
        let good = OptimizationConfig::with_max_tokens(50);
        mgr.configure_session("s", good).await.unwrap();
        assert_eq!(mgr.get_metrics("s").await.unwrap().max_size, 50);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let mgr = Arc::new(manual(10_000));
        let mut handles = Vec::new();
        for s in 0..4 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    mgr.add_item(&format!("s{s}"), sized(ItemType::Message, 0.5, 4))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for s in 0..4 {
            let m = mgr.get_metrics(&format!("s{s}")).await.unwrap();
            assert_eq!(m.item_count, 25);
            assert_eq!(m.current_size, 100);
        }
    }
}
