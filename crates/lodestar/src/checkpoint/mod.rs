//! Named, durable snapshots of a session's working context and transcript.
//!
//! [`CheckpointManager`] serializes a [`ContextSnapshot`] plus the message
//! history into a [`CheckpointRecord`] and hands it to a [`SessionStore`].
//! Restoring a checkpoint only loads it; putting the snapshot back into a
//! live [`ContextManager`](crate::context::ContextManager) is the caller's
//! decision.
//!
//! Automatic checkpoints (taken before destructive tool calls) run retention
//! cleanup as a supervised background task. Cleanup for one session is
//! serialized: a second auto-checkpoint waits for the previous cleanup to
//! finish before writing, and every cleanup can be awaited or cancelled
//! through its [`CleanupHandle`].

pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Message;
use crate::context::ContextSnapshot;
use crate::error::{Error, Result};

pub use store::{
    CheckpointRecord, FileSessionStore, InMemorySessionStore, SessionRecord, SessionStatus,
    SessionStore, extract_message_preview,
};

/// Checkpoints kept per session by automatic retention cleanup.
pub const DEFAULT_KEEP_LAST: usize = 5;

// ── Checkpoint ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub context: ContextSnapshot,
    pub messages: Vec<Message>,
    /// Content hashes of files the session touched, keyed by path.
    pub file_hashes: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Checkpoint {
    /// A new checkpoint with a generated id, stamped now.
    pub fn new(
        session_id: impl Into<String>,
        name: impl Into<String>,
        context: ContextSnapshot,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            name: name.into(),
            description: String::new(),
            created_at: Utc::now(),
            context,
            messages,
            file_hashes: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_file_hash(mut self, path: impl Into<String>, hash: impl Into<String>) -> Self {
        self.file_hashes.insert(path.into(), hash.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn to_record(&self) -> Result<CheckpointRecord> {
        Ok(CheckpointRecord {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            context_data: serde_json::to_string(&self.context)?,
            messages_data: serde_json::to_string(&self.messages)?,
            file_hashes: self.file_hashes.clone(),
            metadata: self.metadata.clone(),
        })
    }

    fn from_record(record: CheckpointRecord) -> Result<Self> {
        let context: ContextSnapshot = serde_json::from_str(&record.context_data)
            .map_err(|e| Error::from(e).context(format!("checkpoint {} context", record.id)))?;
        let messages: Vec<Message> = serde_json::from_str(&record.messages_data)
            .map_err(|e| Error::from(e).context(format!("checkpoint {} messages", record.id)))?;
        Ok(Self {
            id: record.id,
            session_id: record.session_id,
            name: record.name,
            description: record.description,
            created_at: record.created_at,
            context,
            messages,
            file_hashes: record.file_hashes,
            metadata: record.metadata,
        })
    }
}

// ── Cleanup ────────────────────────────────────────────────────────

/// Result of one retention cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub deleted: usize,
    pub failed: usize,
    /// Stopped early because the handle was cancelled.
    pub cancelled: bool,
}

/// Completion signal and cancel switch for a background cleanup.
///
/// Dropping the handle does not stop the task.
#[derive(Debug)]
pub struct CleanupHandle {
    task: JoinHandle<Result<CleanupOutcome>>,
    cancel: CancellationToken,
}

impl CleanupHandle {
    /// Stop deleting at the next checkpoint boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the cleanup to finish.
    pub async fn wait(self) -> Result<CleanupOutcome> {
        self.task
            .await
            .map_err(|e| Error::internal(format!("checkpoint cleanup task failed: {e}")))?
    }
}

// ── Manager ────────────────────────────────────────────────────────

pub struct CheckpointManager {
    store: Arc<dyn SessionStore>,
    keep_last: usize,
    /// Per-session cleanup locks. Held by a running cleanup and by a new
    /// auto-checkpoint while it writes.
    cleanup_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            keep_last: DEFAULT_KEEP_LAST,
            cleanup_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Retention used by automatic checkpoints.
    pub fn with_keep_last(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last;
        self
    }

    pub fn keep_last(&self) -> usize {
        self.keep_last
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn cleanup_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.cleanup_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Persist a fully built checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let record = checkpoint.to_record()?;
        self.store.save_checkpoint(&record).await?;
        info!(
            "Checkpoint {} ({}) created for session {}: {} items, {} messages",
            checkpoint.name,
            checkpoint.id,
            checkpoint.session_id,
            checkpoint.context.items.len(),
            checkpoint.messages.len()
        );
        Ok(())
    }

    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        name: &str,
        description: &str,
        snapshot: ContextSnapshot,
        messages: Vec<Message>,
    ) -> Result<Checkpoint> {
        let checkpoint =
            Checkpoint::new(session_id, name, snapshot, messages).with_description(description);
        self.save(&checkpoint).await?;
        Ok(checkpoint)
    }

    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let record = self
            .store
            .load_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("checkpoint not found: {checkpoint_id}")))?;
        Checkpoint::from_record(record)
    }

    /// Checkpoints of a session, newest first.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let mut records = self.store.list_checkpoints(session_id).await?;
        records.reverse();
        records.into_iter().map(Checkpoint::from_record).collect()
    }

    /// Load a checkpoint for restoration and check its snapshot is intact.
    /// The live context is left untouched.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let checkpoint = self.get_checkpoint(checkpoint_id).await?;
        checkpoint.context.verify()?;
        info!(
            "Restoring checkpoint {} ({}) for session {}",
            checkpoint.name, checkpoint.id, checkpoint.session_id
        );
        Ok(checkpoint)
    }

    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        if self.store.delete_checkpoint(checkpoint_id).await? == 0 {
            return Err(Error::not_found(format!("checkpoint not found: {checkpoint_id}")));
        }
        debug!("Deleted checkpoint {checkpoint_id}");
        Ok(())
    }

    /// Delete every checkpoint of `session_id` beyond the newest `keep_last`.
    ///
    /// Waits for any in-flight background cleanup of the same session.
    pub async fn cleanup_old_checkpoints(
        &self,
        session_id: &str,
        keep_last: usize,
    ) -> Result<CleanupOutcome> {
        let _guard = self.cleanup_lock(session_id).lock_owned().await;
        cleanup(
            self.store.as_ref(),
            session_id,
            keep_last,
            &CancellationToken::new(),
        )
        .await
    }

    /// Create `auto_<operation>_<unix_ts>` and schedule retention cleanup.
    ///
    /// The checkpoint is written before this returns. Cleanup keeps the
    /// configured number of checkpoints and runs in the background; the
    /// returned handle awaits or cancels it.
    pub async fn create_auto_checkpoint(
        &self,
        session_id: &str,
        operation: &str,
        snapshot: ContextSnapshot,
        messages: Vec<Message>,
    ) -> Result<(Checkpoint, CleanupHandle)> {
        let guard = self.cleanup_lock(session_id).lock_owned().await;

        let name = format!("auto_{operation}_{}", Utc::now().timestamp());
        let checkpoint = Checkpoint::new(session_id, name, snapshot, messages)
            .with_description(format!("Automatic checkpoint before {operation}"))
            .with_metadata("auto", true)
            .with_metadata("operation", operation);
        self.save(&checkpoint).await?;

        let handle = self.spawn_cleanup(guard, session_id.to_string());
        Ok((checkpoint, handle))
    }

    fn spawn_cleanup(&self, guard: OwnedMutexGuard<()>, session_id: String) -> CleanupHandle {
        let store = Arc::clone(&self.store);
        let keep_last = self.keep_last;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = cleanup(store.as_ref(), &session_id, keep_last, &token).await;
            if let Err(e) = &result {
                warn!("Checkpoint cleanup for session {session_id} failed: {e}");
            }
            result
        });
        CleanupHandle { task, cancel }
    }
}

async fn cleanup(
    store: &dyn SessionStore,
    session_id: &str,
    keep_last: usize,
    cancel: &CancellationToken,
) -> Result<CleanupOutcome> {
    let mut records = store.list_checkpoints(session_id).await?;
    records.reverse();

    let mut outcome = CleanupOutcome::default();
    for record in records.iter().skip(keep_last) {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        match store.delete_checkpoint(&record.id).await {
            Ok(_) => outcome.deleted += 1,
            Err(e) => {
                warn!("Failed to delete checkpoint {} ({}): {e}", record.name, record.id);
                outcome.failed += 1;
            }
        }
    }

    if outcome.deleted > 0 || outcome.failed > 0 {
        debug!(
            "Checkpoint cleanup for session {session_id}: {} deleted, {} failed",
            outcome.deleted, outcome.failed
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextItem, ItemType};
    use crate::error::ErrorCode;
    use async_trait::async_trait;

    fn snapshot(session: &str) -> ContextSnapshot {
        let items = vec![
            ContextItem::new(ItemType::UserIntent, "fix the parser").with_id("a"),
            ContextItem::new(ItemType::FileContent, "fn main() {}").with_id("b"),
        ];
        ContextSnapshot::new(session, items, 1.0)
    }

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(InMemorySessionStore::new()))
    }

    /// Fails every delete of checkpoints whose name contains "sticky".
    struct StickyStore(InMemorySessionStore);

    #[async_trait]
    impl SessionStore for StickyStore {
        async fn save_checkpoint(&self, r: &CheckpointRecord) -> Result<()> {
            self.0.save_checkpoint(r).await
        }
        async fn load_checkpoint(&self, id: &str) -> Result<Option<CheckpointRecord>> {
            self.0.load_checkpoint(id).await
        }
        async fn list_checkpoints(&self, s: &str) -> Result<Vec<CheckpointRecord>> {
            self.0.list_checkpoints(s).await
        }
        async fn delete_checkpoint(&self, id: &str) -> Result<u64> {
            let sticky = self
                .0
                .load_checkpoint(id)
                .await?
                .is_some_and(|r| r.name.contains("sticky"));
            if sticky {
                return Err(Error::storage("disk is read-only"));
            }
            self.0.delete_checkpoint(id).await
        }
        async fn save_session(&self, r: &SessionRecord) -> Result<()> {
            self.0.save_session(r).await
        }
        async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>> {
            self.0.load_session(id).await
        }
        async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
            self.0.list_sessions().await
        }
        async fn delete_session(&self, id: &str) -> Result<bool> {
            self.0.delete_session(id).await
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let mgr = manager();
        let messages = vec![Message::user("fix the parser"), Message::assistant_text("on it")];
        let created = mgr
            .create_checkpoint("s1", "before-refactor", "manual", snapshot("s1"), messages.clone())
            .await
            .unwrap();

        let loaded = mgr.get_checkpoint(&created.id).await.unwrap();
        assert_eq!(loaded.context, created.context);
        assert_eq!(loaded.messages, messages);
        assert_eq!(loaded.description, "manual");
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let mgr = manager();
        assert!(mgr.get_checkpoint("nope").await.unwrap_err().is(ErrorCode::NotFound));
        assert!(mgr.delete_checkpoint("nope").await.unwrap_err().is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let mgr = manager();
        for name in ["one", "two", "three"] {
            mgr.create_checkpoint("s1", name, "", snapshot("s1"), vec![])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let names: Vec<_> = mgr
            .list_checkpoints("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["three", "two", "one"]);
    }

    #[tokio::test]
    async fn restore_rejects_tampered_snapshot() {
        let store = Arc::new(InMemorySessionStore::new());
        let mgr = CheckpointManager::new(store.clone());
        let cp = mgr
            .create_checkpoint("s1", "cp", "", snapshot("s1"), vec![])
            .await
            .unwrap();
        assert!(mgr.restore_checkpoint(&cp.id).await.is_ok());

        let mut bad = snapshot("s1");
        bad.total_tokens += 1;
        let mut record = cp.to_record().unwrap();
        record.context_data = serde_json::to_string(&bad).unwrap();
        store.save_checkpoint(&record).await.unwrap();
        assert!(mgr.restore_checkpoint(&cp.id).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_keeps_newest() {
        let mgr = manager();
        for i in 0..4 {
            mgr.create_checkpoint("s1", &format!("cp{i}"), "", snapshot("s1"), vec![])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let outcome = mgr.cleanup_old_checkpoints("s1", 2).await.unwrap();
        assert_eq!(outcome.deleted, 2);
        let names: Vec<_> = mgr
            .list_checkpoints("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["cp3", "cp2"]);
    }

    #[tokio::test]
    async fn cleanup_continues_past_failed_delete() {
        let mgr = CheckpointManager::new(Arc::new(StickyStore(InMemorySessionStore::new())));
        for name in ["old", "sticky", "older-still", "newest"] {
            mgr.create_checkpoint("s1", name, "", snapshot("s1"), vec![])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        // Newest first: newest, older-still, sticky, old. Keep 1.
        let outcome = mgr.cleanup_old_checkpoints("s1", 1).await.unwrap();
        assert_eq!(outcome.deleted, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(mgr.list_checkpoints("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn auto_checkpoint_names_and_cleans_up() {
        let mgr = manager().with_keep_last(2);
        let mut last = None;
        for _ in 0..4 {
            let (cp, handle) = mgr
                .create_auto_checkpoint("s1", "write_file", snapshot("s1"), vec![])
                .await
                .unwrap();
            assert!(cp.name.starts_with("auto_write_file_"));
            assert_eq!(cp.metadata["operation"], "write_file");
            last = Some(handle);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let outcome = last.unwrap().wait().await.unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(mgr.list_checkpoints("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn back_to_back_auto_checkpoints_are_serialized() {
        let mgr = manager().with_keep_last(1);
        let (_, first) = mgr
            .create_auto_checkpoint("s1", "edit", snapshot("s1"), vec![])
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        // The second call waits for the first cleanup before writing.
        let (second_cp, second) = mgr
            .create_auto_checkpoint("s1", "edit", snapshot("s1"), vec![])
            .await
            .unwrap();
        assert_eq!(first.wait().await.unwrap().deleted, 0);
        second.wait().await.unwrap();

        let remaining = mgr.list_checkpoints("s1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second_cp.id);
    }

    #[tokio::test]
    async fn cancelled_cleanup_stops_early() {
        let mgr = manager().with_keep_last(0);
        for i in 0..3 {
            mgr.create_checkpoint("s1", &format!("cp{i}"), "", snapshot("s1"), vec![])
                .await
                .unwrap();
        }
        let token = CancellationToken::new();
        token.cancel();
        let outcome = cleanup(mgr.store().as_ref(), "s1", 0, &token).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(mgr.list_checkpoints("s1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn file_hashes_and_metadata_persist() {
        let mgr = manager();
        let cp = Checkpoint::new("s1", "hashed", snapshot("s1"), vec![])
            .with_file_hash("src/lib.rs", "abc123")
            .with_metadata("reason", "pre-merge");
        mgr.save(&cp).await.unwrap();
        let loaded = mgr.get_checkpoint(&cp.id).await.unwrap();
        assert_eq!(loaded, cp);
    }
}
