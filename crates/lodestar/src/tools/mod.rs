//! Tool abstractions for function-calling agents.
//!
//! Every agent capability is a [`Tool`] implementor. Tools declare their
//! inputs as a [`ParamSchema`]; the agent loop validates raw model arguments
//! into [`ToolArgs`] before anything runs, consults the [`PermissionGate`]
//! for tools that declare a [`Capability`], and dispatches through a
//! [`ToolRegistry`] which handles lookup, timeouts and truncation.
//!
//! - [`params`]: tagged parameter schema and argument validation.
//! - [`registry`]: [`Tool`] trait, [`ToolRegistry`], closure-backed [`FnTool`].
//! - [`permission`]: [`PermissionGate`], [`AllowAll`], [`CapabilityPolicy`].

pub mod params;
pub mod permission;
pub mod registry;

pub use params::{ParamKind, ParamSchema, ParamSpec, ToolArgs};
pub use permission::{AllowAll, Capability, CapabilityPolicy, Permission, PermissionGate};
pub use registry::{
    DEFAULT_MAX_RESULT_BYTES, FnTool, Tool, ToolFuture, ToolRegistry, log_tool_call,
    truncate_result,
};
