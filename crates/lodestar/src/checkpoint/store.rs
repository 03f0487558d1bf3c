//! Durable storage for sessions and checkpoints.
//!
//! [`SessionStore`] is the persistence boundary: the checkpoint manager and
//! the agent loop only ever see this trait. Two implementations ship with
//! the crate: [`FileSessionStore`] (one directory per session, atomic JSON
//! writes) and [`InMemorySessionStore`] for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{Message, MessageRole};

// ── Records ────────────────────────────────────────────────────────

/// A checkpoint as persisted. Snapshot and transcript are stored as
/// serialized JSON so the store never needs to understand them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub id: String,
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub context_data: String,
    pub messages_data: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// Session transcript plus bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub total_prompt_tokens: u32,
    pub total_completion_tokens: u32,
    pub estimated_cost_usd: f64,
    /// First ~200 chars of the first user message.
    pub message_preview: String,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            model: model.into(),
            status: SessionStatus::Running,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            estimated_cost_usd: 0.0,
            message_preview: String::new(),
        }
    }

    /// Replace the transcript and refresh the preview and timestamp.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.message_preview = extract_message_preview(&messages);
        self.messages = messages;
        self.updated_at = Utc::now();
    }
}

/// Extract the first ~200 characters of the first user message.
pub fn extract_message_preview(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .and_then(|m| m.content.as_deref())
        .map(|c| c.chars().take(200).collect())
        .unwrap_or_default()
}

// ── Trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a checkpoint.
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()>;

    async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>>;

    /// Checkpoints of one session, oldest first.
    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRecord>>;

    /// Returns the number of rows removed (0 or 1).
    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<u64>;

    async fn save_session(&self, record: &SessionRecord) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    /// Removes the session and all of its checkpoints.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;
}

fn sort_oldest_first(records: &mut [CheckpointRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

// ── File store ─────────────────────────────────────────────────────

/// Directory-per-session store.
///
/// ```text
/// root/
///   <session_id>/
///     session.json
///     checkpoints/
///       <checkpoint_id>.json
/// ```
///
/// Every write goes to a dot-prefixed temp file first and is renamed into
/// place, so a crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::from(e).context(format!("failed to create {}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        check_id(session_id)?;
        Ok(self.root.join(session_id))
    }

    fn checkpoint_path(&self, session_id: &str, checkpoint_id: &str) -> Result<PathBuf> {
        check_id(checkpoint_id)?;
        Ok(self
            .session_dir(session_id)?
            .join("checkpoints")
            .join(format!("{checkpoint_id}.json")))
    }

    /// Session directories currently on disk.
    async fn session_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(Error::from(e).context("failed to read sessions dir")),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.is_ok_and(|ft| ft.is_dir()) {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Locate a checkpoint file by id across all sessions.
    async fn find_checkpoint(&self, checkpoint_id: &str) -> Result<Option<PathBuf>> {
        check_id(checkpoint_id)?;
        for dir in self.session_dirs().await? {
            let path = dir.join("checkpoints").join(format!("{checkpoint_id}.json"));
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

/// Ids become path components, so they must be plain names.
fn check_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.contains("..")
    {
        return Err(Error::invalid_arguments(format!("invalid id: {id:?}")));
    }
    Ok(())
}

/// Atomic write: serialize to a temp file, then rename into place.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::storage(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::from(e).context("failed to create record dir"))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| Error::from(e).context("failed to write temp record"))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::from(e).context("failed to rename record"))?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::from(e).context(format!("failed to read {}", path.display()))),
    };
    let value = serde_json::from_str(&json)
        .map_err(|e| Error::from(e).context(format!("failed to parse {}", path.display())))?;
    Ok(Some(value))
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        let path = self.checkpoint_path(&record.session_id, &record.id)?;
        write_json_atomic(&path, record).await?;
        debug!("Saved checkpoint {} to {}", record.id, path.display());
        Ok(())
    }

    async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        match self.find_checkpoint(checkpoint_id).await? {
            Some(path) => read_json(&path).await,
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRecord>> {
        let dir = self.session_dir(session_id)?.join("checkpoints");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::from(e).context("failed to read checkpoints dir")),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match read_json::<CheckpointRecord>(&entry.path()).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable checkpoint {}: {e}", entry.path().display()),
            }
        }
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<u64> {
        let Some(path) = self.find_checkpoint(checkpoint_id).await? else {
            return Ok(0);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::from(e).context("failed to remove checkpoint")),
        }
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let path = self.session_dir(&record.id)?.join("session.json");
        write_json_atomic(&path, record).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.session_dir(session_id)?.join("session.json");
        read_json(&path).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut sessions = Vec::new();
        for dir in self.session_dirs().await? {
            let path = dir.join("session.json");
            match read_json::<SessionRecord>(&path).await {
                Ok(Some(record)) => sessions.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping malformed session at {}: {e}", path.display()),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from(e).context("failed to delete session dir")),
        }
    }
}

// ── In-memory store ────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    checkpoints: Mutex<HashMap<String, CheckpointRecord>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        checkpoints.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(checkpoint_id).cloned())
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRecord>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<CheckpointRecord> = checkpoints
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<u64> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(u64::from(checkpoints.remove(checkpoint_id).is_some()))
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<SessionRecord> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, r| r.session_id != session_id);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sessions.remove(session_id).is_some())
    }
}
