//! Events and handlers for the [`AgentLoop`](super::AgentLoop).
//!
//! The loop reports its progress through [`AgentEvent`] variants covering
//! the whole run, from iteration start through tool execution to
//! completion. Callers implement [`EventHandler`] to observe them for
//! logging, UI rendering or metrics.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::ContextMetrics;

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AgentEvent<'a> {
    /// A new completion call is about to be issued.
    IterationStart {
        iteration: u32,
        max_iterations: u32,
        context: Option<&'a ContextMetrics>,
    },
    /// The model returned text (may accompany tool calls).
    Text(&'a str),
    /// The model requested tool calls this iteration.
    ToolCallsReceived { iteration: u32, count: usize },
    /// A single tool is about to run.
    ToolExecuting { name: &'a str, arguments: &'a str },
    /// A single tool finished. Failures carry the error text as `result`.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        success: bool,
    },
    /// The permission gate refused a tool call.
    PermissionDenied { name: &'a str, reason: &'a str },
    /// A failed completion call will be retried after `delay`.
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: &'a str,
    },
    /// Token usage reported for one completion call.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An automatic checkpoint was written before a destructive tool.
    CheckpointCreated { checkpoint_id: &'a str, name: &'a str },
    /// The run ended. `complete` is false when the model stopped for a
    /// reason other than finishing its turn.
    Finished { iterations: u32, complete: bool },
    /// The run hit the iteration limit.
    IterationLimitReached { max_iterations: u32 },
}

/// Observer of agent loop events.
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &AgentEvent<'_>) {
///         if let AgentEvent::Text(text) = event {
///             println!("{text}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AgentEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let AgentEvent::Text(text) = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AgentEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_metrics_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler without breaking the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        match event {
            AgentEvent::IterationStart {
                iteration,
                max_iterations,
                context,
            } => match context {
                Some(m) => info!(
                    "[iteration {iteration}/{max_iterations}] context {}/{} tokens ({:.0}%), {} items",
                    m.current_size,
                    m.max_size,
                    m.utilization() * 100.0,
                    m.item_count
                ),
                None => info!("[iteration {iteration}/{max_iterations}]"),
            },
            AgentEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "LLM text: {preview}{}",
                    if text.chars().count() > 200 { "..." } else { "" }
                );
            }
            AgentEvent::ToolCallsReceived { iteration, count } => {
                debug!("{count} tool call(s) in iteration {iteration}");
            }
            AgentEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            AgentEvent::ToolResult {
                name,
                result,
                success,
                ..
            } => {
                if *success {
                    debug!("Tool {name} result: {} bytes", result.len());
                } else {
                    warn!("Tool {name} failed: {result}");
                }
            }
            AgentEvent::PermissionDenied { name, reason } => {
                warn!("Permission denied for tool {name}: {reason}");
            }
            AgentEvent::RetryScheduled {
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                warn!(
                    "Completion attempt {attempt}/{max_attempts} failed: {error}. Retrying in {:.1}s",
                    delay.as_secs_f64()
                );
            }
            AgentEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            AgentEvent::CheckpointCreated {
                checkpoint_id,
                name,
            } => {
                info!("Checkpoint {name} created ({checkpoint_id})");
            }
            AgentEvent::Finished {
                iterations,
                complete,
            } => {
                if *complete {
                    info!("Agent finished after {iterations} iteration(s)");
                } else {
                    info!("Agent stopped early after {iterations} iteration(s); response is partial");
                }
            }
            AgentEvent::IterationLimitReached { max_iterations } => {
                info!("Agent hit iteration limit ({max_iterations})");
            }
        }
    }
}
