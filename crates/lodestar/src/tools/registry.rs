//! Tool abstraction and name-keyed dispatch.
//!
//! Every tool exposes a name, a description and a [`ParamSchema`], and an
//! async [`Tool::execute`] that receives already-validated [`ToolArgs`].
//! Tools are collected into a [`ToolRegistry`] which handles lookup,
//! definition export, timeouts and result truncation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::params::{ParamSchema, ToolArgs};
use super::permission::Capability;
use crate::ToolDef;
use crate::error::{Error, ErrorCode, Result};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that an agent can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct ReadFile { root: PathBuf, params: ParamSchema }
///
/// impl Tool for ReadFile {
///     fn name(&self) -> &str { "read_file" }
///     fn description(&self) -> &str { "Read a file" }
///     fn parameters(&self) -> &ParamSchema { &self.params }
///     fn capability(&self) -> Option<Capability> { Some(Capability::Read) }
///     fn resource(&self, args: &ToolArgs) -> String {
///         args.str("path").unwrap_or_default().to_string()
///     }
///     fn execute(&self, args: ToolArgs) -> ToolFuture<'_> {
///         Box::pin(async move {
///             let path = self.root.join(args.require_str("path")?);
///             Ok(tokio::fs::read_to_string(path).await?)
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &ParamSchema;

    fn execute(&self, args: ToolArgs) -> ToolFuture<'_>;

    /// Capability the permission gate must grant first. `None` skips the check.
    fn capability(&self) -> Option<Capability> {
        None
    }

    /// Resource string shown to the permission gate.
    fn resource(&self, _args: &ToolArgs) -> String {
        self.name().to_string()
    }

    /// Destructive tools trigger an automatic checkpoint before they run.
    fn is_destructive(&self) -> bool {
        false
    }

    fn definition(&self) -> ToolDef {
        ToolDef::new(
            self.name(),
            self.description(),
            self.parameters().to_json_schema(),
        )
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// A collection of tools with name-based dispatch.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    max_result_bytes: usize,
    timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            timeout: None,
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Per-call execution limit. A tool that overruns it fails with a
    /// `timeout` error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a tool. Replaces any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            debug!("Tool {name} replaced in registry");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown tool '{name}'")))
    }

    /// Definitions for the completion request, sorted by name so the
    /// advertised tool list is stable across runs.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Run a resolved tool with validated arguments, applying the timeout
    /// and truncating the output.
    pub async fn execute(&self, tool: &dyn Tool, args: ToolArgs) -> Result<String> {
        let name = tool.name().to_string();
        let start = Instant::now();

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(args)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        start.elapsed().as_secs_f64(),
                        limit.as_secs_f64(),
                    );
                    Err(Error::new(
                        ErrorCode::Timeout,
                        format!(
                            "tool '{name}' timed out after {:.0} seconds",
                            limit.as_secs_f64()
                        ),
                    )
                    .with_user_message(
                        "Consider breaking the task into smaller steps or using different arguments.",
                    ))
                }
            },
            None => tool.execute(args).await,
        };

        let output = result?;
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes)",
            start.elapsed().as_secs_f64() * 1000.0,
            output.len()
        );
        trace!(
            "Tool {name} result preview: {}",
            output.chars().take(300).collect::<String>()
        );
        Ok(truncate_result(output, self.max_result_bytes))
    }

    /// Resolve, validate and run in one step. Permission checks are the
    /// caller's responsibility.
    pub async fn call(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self.resolve(name)?;
        let args = tool
            .parameters()
            .parse(arguments)
            .map_err(|e| e.context(format!("tool '{name}'")))?;
        log_tool_call(name, arguments);
        self.execute(tool.as_ref(), args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("max_result_bytes", &self.max_result_bytes)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(ToolArgs) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync,
>;

/// A closure-backed tool.
///
/// ```ignore
/// let echo = FnTool::new(
///     "echo",
///     "Echo the input back",
///     ParamSchema::new().required("text", ParamKind::String, "Text to echo"),
///     |args| async move { Ok(args.require_str("text")?.to_string()) },
/// );
/// ```
pub struct FnTool {
    name: String,
    description: String,
    params: ParamSchema,
    handler: ErasedToolHandler,
    capability: Option<Capability>,
    destructive: bool,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            handler: Box::new(move |args| Box::pin(handler(args))),
            capability: None,
            destructive: false,
        }
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ParamSchema {
        &self.params
    }

    fn capability(&self) -> Option<Capability> {
        self.capability
    }

    fn is_destructive(&self) -> bool {
        self.destructive
    }

    fn execute(&self, args: ToolArgs) -> ToolFuture<'_> {
        (self.handler)(args)
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("destructive", &self.destructive)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Log a tool call: a 120-char preview at info, size at debug, the full
/// arguments at trace.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes on a char boundary, appending
/// a notice if trimmed.
pub fn truncate_result(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let total = s.len();
    let cut = (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
    s.truncate(cut);
    format!("{s}...\n[truncated: {total} bytes total]")
}
