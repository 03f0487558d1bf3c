//! Context-optimizing, failure-tolerant core for tool-calling coding agents.
//!
//! `lodestar` keeps a long-running, multi-turn agent task inside a bounded
//! token budget while it keeps making progress against an unreliable,
//! rate-limited completion backend. Two halves cooperate:
//!
//! - **Adaptive working memory.** The [`ContextManager`](context::ContextManager)
//!   owns a per-session set of scored [`ContextItem`](context::ContextItem)s,
//!   sorts them into Hot/Warm/Cold tiers, and shrinks the set with one of five
//!   interchangeable [strategies](context::strategies) once utilization
//!   crosses a threshold. The [`CheckpointManager`](checkpoint::CheckpointManager)
//!   keeps durable, restorable copies.
//! - **A resilient control loop.** The [`AgentLoop`](agent::AgentLoop) drives
//!   completion → tool execution iterations, calling the backend through a
//!   [`RetryExecutor`](resilience::RetryExecutor) and a per-provider
//!   [`CircuitBreaker`](resilience::CircuitBreaker), and converting tool
//!   failures into feedback the model can act on.
//!
//! # Getting started
//!
//! ```ignore
//! use lodestar::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> lodestar::Result<()> {
//!     let service = Arc::new(OpenRouterService::from_env()?);
//!     let context = Arc::new(ContextManager::new(OptimizationConfig::with_max_tokens(100_000)));
//!     let tools = Arc::new(ToolRegistry::new());
//!
//!     let agent = AgentLoop::new(service, tools, context, AgentConfig::default())
//!         .with_event_handler(Arc::new(LoggingHandler));
//!
//!     let response = agent
//!         .run(AgentRequest::new("session-1", "Summarize src/main.rs"))
//!         .await
//!         .map_err(|f| f.error)?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`context`] | Scored items, tier allocation, optimization strategies, session manager |
//! | [`checkpoint`] | Named durable snapshots, retention cleanup, session stores |
//! | [`resilience`] | Circuit breaker, retry with backoff, error recovery bookkeeping |
//! | [`agent`] | Tool-calling agent loop, events, request/response types |
//! | [`tools`] | Tool trait, registry, typed parameter schemas, permission gate |
//! | [`api`] | Completion service boundary, OpenRouter adapter, pricing |
//! | [`config`] | TOML + environment configuration |
//! | [`error`] | Coded error type shared by every module |

pub mod agent;
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;
pub mod resilience;
pub mod tools;

use serde::{Deserialize, Serialize};

pub use error::{Error, ErrorCode, Result};

/// Default model used when none is configured.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Messages ───────────────────────────────────────────────────────

/// Conversation role.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A single chat message in OpenAI-compatible shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn that requested tool calls, optionally with partial text.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ── Tool definitions ───────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition advertised to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool invocation requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}
