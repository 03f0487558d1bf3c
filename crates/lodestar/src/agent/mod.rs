//! Agent runtime: the [`AgentLoop`] and its supporting types.
//!
//! - [`runner::AgentLoop`] drives completion and tool-execution iterations.
//!   Start here.
//! - [`config::AgentConfig`] holds model, iteration and retry settings.
//! - [`events`] has the [`EventHandler`] trait and [`AgentEvent`] enum for
//!   observing the loop, with [`LoggingHandler`], [`CompositeEventHandler`]
//!   and [`FnEventHandler`].
//! - [`types`] has the request, response and failure types.

pub mod config;
pub mod events;
pub mod runner;
pub mod types;

pub use config::{AgentConfig, DEFAULT_CONTEXT_TOKENS, DEFAULT_MAX_ITERATIONS};
pub use events::{
    AgentEvent, CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use runner::AgentLoop;
pub use types::{AgentFailure, AgentRequest, AgentResponse, RunState, ToolExecution};
