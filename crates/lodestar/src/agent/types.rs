//! Request, response and failure types of an agent run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Message;
use crate::api::{StopReason, Usage};
use crate::error::Error;

/// One task for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_id: String,
    pub message: String,
    /// Prior conversation, oldest first. Excludes the system prompt.
    pub history: Vec<Message>,
    /// Pre-fetched context. When `None` the loop asks the context manager.
    pub context: Option<String>,
}

impl AgentRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            history: Vec::new(),
            context: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A tool call the loop performed, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub iteration: u32,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    /// Tool output, or the error text fed back to the model.
    pub output: String,
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Where a run stands. `Calling` and `Executing` are live states; the
/// other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Calling,
    Executing,
    Done,
    Failed,
    Exhausted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Exhausted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: String,
    /// Text the model produced across all iterations, joined by blank lines.
    pub content: String,
    pub tool_executions: Vec<ToolExecution>,
    pub usage: Usage,
    pub estimated_cost_usd: f64,
    pub iterations: u32,
    /// True only when the model ended its turn on its own.
    pub complete: bool,
    pub state: RunState,
    pub stop_reason: Option<StopReason>,
    /// Full transcript including the new user message and tool results.
    pub messages: Vec<Message>,
}

/// A run that ended in `Failed` or `Exhausted`, with whatever progress was
/// made before it stopped.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AgentFailure {
    #[source]
    pub error: Error,
    pub partial: Box<AgentResponse>,
}

impl AgentFailure {
    pub fn into_error(self) -> Error {
        self.error
    }
}
