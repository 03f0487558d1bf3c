//! Convenience re-exports for common `lodestar` types.
//!
//! Meant to be glob-imported when building agents:
//!
//! ```ignore
//! use lodestar::prelude::*;
//! ```
//!
//! Strategy internals, store records and stream types are left out; import
//! those from their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Error, ErrorCode, Message, Result, ToolCall, ToolDef};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentConfig, AgentEvent, AgentFailure, AgentLoop, AgentRequest, AgentResponse,
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, RunState,
};

// ── Completion backend ──────────────────────────────────────────────
pub use crate::api::{Completion, CompletionRequest, CompletionService, OpenRouterService, StopReason, Usage};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    ContextItem, ContextManager, ContextMetrics, ItemType, OptimizationConfig, StrategyKind, Tier,
};

// ── Checkpoints ─────────────────────────────────────────────────────
pub use crate::checkpoint::{Checkpoint, CheckpointManager, FileSessionStore, InMemorySessionStore, SessionStore};

// ── Resilience ──────────────────────────────────────────────────────
pub use crate::resilience::{BreakerConfig, CircuitBreaker, ErrorRecovery, RetryExecutor, RetryPolicy};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    AllowAll, Capability, CapabilityPolicy, FnTool, ParamKind, ParamSchema, PermissionGate, Tool,
    ToolArgs, ToolFuture, ToolRegistry,
};

pub use crate::config::LodestarConfig;
