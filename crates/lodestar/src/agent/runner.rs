//! The tool-calling agent loop.
//!
//! One [`AgentLoop::run`] drives a request through a small state machine:
//!
//! ```text
//!            ┌──────────── tool results appended ─────────────┐
//!            ▼                                                │
//!  start → Calling ── stop_reason = tool_use ──▶ Executing ───┘
//!            │
//!            ├── end_turn / stop_sequence ─▶ Done (complete)
//!            ├── any other stop reason ────▶ Done (partial)
//!            ├── completion failed ────────▶ Failed
//!            └── iteration limit ──────────▶ Exhausted
//! ```
//!
//! Completion calls go through the provider's [`CircuitBreaker`] inside a
//! [`RetryExecutor`]. Tool failures never abort the run on their own: they
//! become error-text tool results so the model can correct itself, and only
//! a streak of them (see [`ErrorRecovery`]) ends the run.
//!
//! [`CircuitBreaker`]: crate::resilience::CircuitBreaker

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::AgentConfig;
use super::events::{AgentEvent, EventHandler, NoopHandler};
use super::types::{AgentFailure, AgentRequest, AgentResponse, RunState, ToolExecution};
use crate::api::{
    Completion, CompletionRequest, CompletionService, CostTracker, ModelPricing, StopReason,
    Usage, generate_trace_id, pricing_for_model,
};
use crate::checkpoint::{
    CheckpointManager, CleanupHandle, SessionRecord, SessionStatus, SessionStore,
};
use crate::context::{ContextItem, ContextManager, ContextSnapshot, ItemType};
use crate::error::{Error, ErrorCode, Result};
use crate::resilience::{ErrorRecovery, RetryExecutor};
use crate::tools::{AllowAll, Permission, PermissionGate, ToolRegistry, log_tool_call};
use crate::{Message, ToolCall};

/// Relevance given to recorded tool results.
const TOOL_RESULT_RELEVANCE: f64 = 0.6;

pub struct AgentLoop {
    service: Arc<dyn CompletionService>,
    tools: Arc<ToolRegistry>,
    context: Arc<ContextManager>,
    config: AgentConfig,
    events: Arc<dyn EventHandler>,
    permissions: Arc<dyn PermissionGate>,
    checkpoints: Option<Arc<CheckpointManager>>,
    recovery: Arc<ErrorRecovery>,
    store: Option<Arc<dyn SessionStore>>,
    cancel: CancellationToken,
    pricing: ModelPricing,
}

/// Progress of one run.
struct RunAccumulator {
    messages: Vec<Message>,
    text_output: Vec<String>,
    executions: Vec<ToolExecution>,
    costs: CostTracker,
    iterations: u32,
    stop_reason: Option<StopReason>,
    /// Retention cleanups started by auto-checkpoints, awaited before return.
    cleanups: Vec<CleanupHandle>,
}

impl RunAccumulator {
    fn into_response(self, session_id: &str, state: RunState) -> AgentResponse {
        AgentResponse {
            session_id: session_id.to_string(),
            content: self.text_output.join("\n\n"),
            tool_executions: self.executions,
            usage: self.costs.usage,
            estimated_cost_usd: self.costs.estimated_cost_usd,
            iterations: self.iterations,
            complete: state == RunState::Done
                && matches!(
                    self.stop_reason,
                    Some(StopReason::EndTurn | StopReason::StopSequence)
                ),
            state,
            stop_reason: self.stop_reason,
            messages: self.messages,
        }
    }
}

impl AgentLoop {
    pub fn new(
        service: Arc<dyn CompletionService>,
        tools: Arc<ToolRegistry>,
        context: Arc<ContextManager>,
        config: AgentConfig,
    ) -> Self {
        let pricing = pricing_for_model(&config.model);
        Self {
            service,
            tools,
            context,
            config,
            events: Arc::new(NoopHandler),
            permissions: Arc::new(AllowAll),
            checkpoints: None,
            recovery: Arc::new(ErrorRecovery::default()),
            store: None,
            cancel: CancellationToken::new(),
            pricing,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    pub fn with_permissions(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.permissions = gate;
        self
    }

    /// Take an automatic checkpoint before every destructive tool call.
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Share consecutive-error counters and breakers with other loops.
    pub fn with_recovery(mut self, recovery: Arc<ErrorRecovery>) -> Self {
        self.recovery = recovery;
        self
    }

    /// Persist the transcript after every run.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Drive `request` to completion.
    ///
    /// On failure the returned [`AgentFailure`] still carries the partial
    /// response: text, tool executions and usage accumulated so far.
    pub async fn run(&self, request: AgentRequest) -> std::result::Result<AgentResponse, AgentFailure> {
        let session_id = request.session_id.as_str();
        let trace_id = generate_trace_id();
        info!(
            "Agent run started: trace_id={}, session={}, model={}, tools={}",
            trace_id,
            session_id,
            self.config.model,
            self.tools.len()
        );
        // Failure streaks never carry over from an earlier run.
        self.recovery.reset(session_id);

        let system_prompt = self.system_prompt(&request).await;
        self.record(session_id, user_item(&request)).await;

        let mut messages = request.history.clone();
        messages.push(Message::user(request.message.clone()));
        let mut acc = RunAccumulator {
            messages,
            text_output: Vec::new(),
            executions: Vec::new(),
            costs: CostTracker::new(),
            iterations: 0,
            stop_reason: None,
            cleanups: Vec::new(),
        };

        let tool_defs = self.tools.definitions();
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut state = RunState::Calling;

        let outcome = loop {
            match state {
                RunState::Calling => {
                    if acc.iterations >= self.config.max_iterations {
                        self.events.on_event(&AgentEvent::IterationLimitReached {
                            max_iterations: self.config.max_iterations,
                        });
                        state = RunState::Exhausted;
                        break Err(Error::new(
                            ErrorCode::MaxIterations,
                            format!(
                                "agent reached the iteration limit ({}) without finishing",
                                self.config.max_iterations
                            ),
                        )
                        .with_retryable(false)
                        .with_user_message(
                            "The task did not finish within the iteration limit; partial progress is attached.",
                        ));
                    }
                    if self.cancel.is_cancelled() {
                        state = RunState::Failed;
                        break Err(Error::cancelled());
                    }

                    acc.iterations += 1;
                    let metrics = self.context.get_metrics(session_id).await.ok();
                    self.events.on_event(&AgentEvent::IterationStart {
                        iteration: acc.iterations,
                        max_iterations: self.config.max_iterations,
                        context: metrics.as_ref(),
                    });

                    let completion_request = CompletionRequest::new(&self.config.model, acc.messages.clone())
                        .with_system_prompt(system_prompt.clone())
                        .with_tools(tool_defs.clone())
                        .with_max_tokens(self.config.max_tokens)
                        .with_temperature(self.config.temperature);

                    let completion = match self.complete(&completion_request).await {
                        Ok(c) => c,
                        Err(e) => {
                            state = RunState::Failed;
                            break Err(e.context(format!("completion failed at iteration {}", acc.iterations)));
                        }
                    };
                    state = self.absorb(completion, &mut acc, &mut pending);
                }
                RunState::Executing => {
                    self.events.on_event(&AgentEvent::ToolCallsReceived {
                        iteration: acc.iterations,
                        count: pending.len(),
                    });
                    match self.execute_all(session_id, &mut pending, &mut acc).await {
                        Ok(()) => state = RunState::Calling,
                        Err(e) => {
                            state = RunState::Failed;
                            break Err(e);
                        }
                    }
                }
                RunState::Done | RunState::Failed | RunState::Exhausted => break Ok(()),
            }
        };

        self.await_cleanups(&mut acc.cleanups).await;
        let cost_summary = acc.costs.summary();
        let response = acc.into_response(session_id, state);
        self.persist(&response, &request).await;
        info!(
            "Agent run ended: trace_id={}, session={}, state={:?}, iterations={}, tool calls={}, {}",
            trace_id,
            session_id,
            response.state,
            response.iterations,
            response.tool_executions.len(),
            cost_summary
        );

        match outcome {
            Ok(()) => {
                self.events.on_event(&AgentEvent::Finished {
                    iterations: response.iterations,
                    complete: response.complete,
                });
                Ok(response)
            }
            Err(error) => Err(AgentFailure {
                error,
                partial: Box::new(response),
            }),
        }
    }

    /// Fold one completion into the run and pick the next state.
    fn absorb(&self, completion: Completion, acc: &mut RunAccumulator, pending: &mut Vec<ToolCall>) -> RunState {
        acc.costs.record(completion.usage, &self.pricing);
        self.events.on_event(&AgentEvent::TokenUsage {
            prompt_tokens: completion.usage.prompt_tokens,
            completion_tokens: completion.usage.completion_tokens,
        });

        let text = completion.content.filter(|t| !t.trim().is_empty());
        if let Some(text) = &text {
            self.events.on_event(&AgentEvent::Text(text));
            acc.text_output.push(text.clone());
        }

        debug!(
            "Iteration {}: stop_reason={:?}, {} tool call(s)",
            acc.iterations,
            completion.stop_reason,
            completion.tool_calls.len()
        );
        let next = match &completion.stop_reason {
            StopReason::ToolUse if !completion.tool_calls.is_empty() => {
                acc.messages
                    .push(Message::assistant_tool_calls(text, completion.tool_calls.clone()));
                *pending = completion.tool_calls;
                RunState::Executing
            }
            _ => {
                if !completion.tool_calls.is_empty() {
                    acc.messages
                        .push(Message::assistant_tool_calls(text, completion.tool_calls));
                } else if let Some(text) = text {
                    acc.messages.push(Message::assistant_text(text));
                }
                RunState::Done
            }
        };
        acc.stop_reason = Some(completion.stop_reason);
        next
    }

    /// One completion call through retry and the provider's breaker.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let breaker = self.recovery.breaker(self.service.name());
        let breaker = &breaker;
        let service = self.service.as_ref();
        let events = Arc::clone(&self.events);
        let retry = RetryExecutor::new(self.config.retry.clone())
            .with_cancellation(self.cancel.clone())
            .on_retry(move |attempt| {
                events.on_event(&AgentEvent::RetryScheduled {
                    attempt: attempt.attempt,
                    max_attempts: attempt.max_attempts,
                    delay: attempt.delay,
                    error: &attempt.error.to_string(),
                });
            });
        retry
            .run(move |_| async move { breaker.call(|| service.create_completion(request)).await })
            .await
    }

    /// Run every pending call in order. Errors only when the consecutive
    /// failure limit is hit.
    async fn execute_all(
        &self,
        session_id: &str,
        pending: &mut Vec<ToolCall>,
        acc: &mut RunAccumulator,
    ) -> Result<()> {
        for call in std::mem::take(pending) {
            let execution = self.execute_tool(session_id, &call, acc).await;
            acc.messages
                .push(Message::tool_result(&call.id, execution.output.clone()));
            self.record(
                session_id,
                ContextItem::new(
                    ItemType::ToolResult,
                    format!("{}: {}", execution.name, execution.output),
                )
                .with_relevance(TOOL_RESULT_RELEVANCE)
                .with_metadata("tool", execution.name.clone())
                .with_metadata("call_id", execution.call_id.clone()),
            )
            .await;

            let success = execution.success;
            acc.executions.push(execution);
            if success {
                self.recovery.record_success(session_id);
            } else if self.recovery.record_error(session_id) {
                return Err(Error::new(
                    ErrorCode::TooManyErrors,
                    format!(
                        "{} consecutive tool failures",
                        self.recovery.consecutive_errors(session_id)
                    ),
                )
                .with_retryable(false));
            }
        }
        Ok(())
    }

    /// Resolve, validate, permission-check, checkpoint and run one call.
    /// Every failure becomes error text for the model.
    async fn execute_tool(&self, session_id: &str, call: &ToolCall, acc: &mut RunAccumulator) -> ToolExecution {
        let name = call.function.name.as_str();
        let arguments = call.function.arguments.as_str();
        self.events
            .on_event(&AgentEvent::ToolExecuting { name, arguments });
        log_tool_call(name, arguments);

        let start = Instant::now();
        let result = self.try_execute_tool(session_id, call, acc).await;
        let (output, success) = match result {
            Ok(output) => (output, true),
            Err(e) => (error_text(&e), false),
        };

        self.events.on_event(&AgentEvent::ToolResult {
            name,
            call_id: &call.id,
            result: &output,
            success,
        });
        ToolExecution {
            iteration: acc.iterations,
            call_id: call.id.clone(),
            name: name.to_string(),
            arguments: arguments.to_string(),
            output,
            success,
            duration: start.elapsed(),
        }
    }

    async fn try_execute_tool(&self, session_id: &str, call: &ToolCall, acc: &mut RunAccumulator) -> Result<String> {
        let name = call.function.name.as_str();
        let tool = self.tools.resolve(name)?;
        let args = tool
            .parameters()
            .parse(&call.function.arguments)
            .map_err(|e| e.context(format!("tool '{name}'")))?;

        if let Some(capability) = tool.capability() {
            let resource = tool.resource(&args);
            if let Permission::Denied(reason) = self.permissions.check(capability, &resource).await {
                self.events
                    .on_event(&AgentEvent::PermissionDenied { name, reason: &reason });
                return Err(Error::new(
                    ErrorCode::PermissionDenied,
                    format!("permission denied for {capability} on '{resource}': {reason}"),
                ));
            }
        }

        if tool.is_destructive()
            && let Some(cleanup) = self.auto_checkpoint(session_id, name, &acc.messages).await
        {
            acc.cleanups.push(cleanup);
        }

        self.tools
            .execute(tool.as_ref(), args)
            .await
            .map_err(|e| Error::tool_failed(name, e))
    }

    /// Checkpoint failures are logged and never block the tool.
    async fn auto_checkpoint(
        &self,
        session_id: &str,
        operation: &str,
        messages: &[Message],
    ) -> Option<CleanupHandle> {
        let checkpoints = self.checkpoints.as_ref()?;
        let snapshot = match self.context.create_snapshot(session_id).await {
            Ok(snapshot) => snapshot,
            Err(_) => ContextSnapshot::new(session_id, Vec::new(), 1.0),
        };
        match checkpoints
            .create_auto_checkpoint(session_id, operation, snapshot, messages.to_vec())
            .await
        {
            Ok((checkpoint, cleanup)) => {
                self.events.on_event(&AgentEvent::CheckpointCreated {
                    checkpoint_id: &checkpoint.id,
                    name: &checkpoint.name,
                });
                Some(cleanup)
            }
            Err(e) => {
                warn!("Auto-checkpoint before {operation} failed: {e}");
                None
            }
        }
    }

    /// Wait out retention cleanups so none outlive the run. A cancelled run
    /// stops them at the next checkpoint boundary.
    async fn await_cleanups(&self, cleanups: &mut Vec<CleanupHandle>) {
        for cleanup in cleanups.drain(..) {
            if self.cancel.is_cancelled() {
                cleanup.cancel();
            }
            match cleanup.wait().await {
                Ok(outcome) if outcome.deleted > 0 || outcome.failed > 0 => debug!(
                    "Checkpoint cleanup: {} deleted, {} failed",
                    outcome.deleted, outcome.failed
                ),
                Ok(_) => {}
                Err(e) => warn!("Checkpoint cleanup failed: {e}"),
            }
        }
    }

    /// Configured system prompt plus a `<context>` block.
    async fn system_prompt(&self, request: &AgentRequest) -> String {
        let context = match &request.context {
            Some(context) => Some(context.clone()),
            None => {
                self.context
                    .render_context(&request.session_id, self.config.context_tokens)
                    .await
            }
        };
        let mut prompt = self.config.system_prompt.clone().unwrap_or_default();
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str("<context>\n");
            prompt.push_str(&context);
            prompt.push_str("\n</context>");
        }
        prompt
    }

    async fn record(&self, session_id: &str, item: ContextItem) {
        if !self.config.record_context {
            return;
        }
        if let Err(e) = self.context.add_item(session_id, item).await {
            warn!("Failed to record context item for session {session_id}: {e}");
        }
    }

    /// Save the transcript when a store is attached. Failures are logged.
    async fn persist(&self, response: &AgentResponse, request: &AgentRequest) {
        let Some(store) = &self.store else {
            return;
        };
        let existing = match store.load_session(&request.session_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load session {}: {e}", request.session_id);
                None
            }
        };
        let mut record = existing
            .unwrap_or_else(|| SessionRecord::new(request.session_id.clone(), self.config.model.clone()));
        record.model = self.config.model.clone();
        record.status = match response.state {
            RunState::Done => SessionStatus::Completed,
            RunState::Failed if self.cancel.is_cancelled() => SessionStatus::Interrupted,
            _ => SessionStatus::Failed,
        };
        record.set_messages(response.messages.clone());
        add_usage(&mut record, response.usage, response.estimated_cost_usd);
        if let Err(e) = store.save_session(&record).await {
            warn!("Failed to save session {}: {e}", request.session_id);
        }
    }
}

fn add_usage(record: &mut SessionRecord, usage: Usage, cost: f64) {
    record.total_prompt_tokens += usage.prompt_tokens;
    record.total_completion_tokens += usage.completion_tokens;
    record.estimated_cost_usd += cost;
}

/// The user's message is the task's intent when it opens a conversation.
fn user_item(request: &AgentRequest) -> ContextItem {
    let item_type = if request.history.is_empty() {
        ItemType::UserIntent
    } else {
        ItemType::Message
    };
    ContextItem::new(item_type, request.message.clone())
}

/// Tool-result text for a failed call.
fn error_text(error: &Error) -> String {
    match error.user_message() {
        Some(hint) => format!("Error: {error}. {hint}"),
        None => format!("Error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Completion;
    use crate::checkpoint::InMemorySessionStore;
    use crate::context::OptimizationConfig;
    use crate::resilience::RetryPolicy;
    use crate::tools::{Capability, CapabilityPolicy, FnTool, ParamKind, ParamSchema};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed list of outcomes and records every request.
    struct Scripted {
        replies: Mutex<VecDeque<Result<Completion>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Completion>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn create_completion(&self, request: &CompletionRequest) -> Result<Completion> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(text("out of script", StopReason::EndTurn)))
        }
    }

    fn usage() -> Usage {
        Usage {
            prompt_tokens: 100,
            completion_tokens: 10,
        }
    }

    fn text(content: &str, stop: StopReason) -> Completion {
        Completion {
            content: Some(content.into()),
            tool_calls: vec![],
            stop_reason: stop,
            usage: usage(),
        }
    }

    fn calls(calls: Vec<ToolCall>) -> Completion {
        Completion {
            content: None,
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: usage(),
        }
    }

    fn echo() -> FnTool {
        FnTool::new(
            "echo",
            "Echo text",
            ParamSchema::new().required("text", ParamKind::String, ""),
            |args| async move { Ok(format!("echo: {}", args.require_str("text")?)) },
        )
    }

    fn failing() -> FnTool {
        FnTool::new("broken", "Always fails", ParamSchema::new(), |_| async {
            Err(Error::internal("disk on fire"))
        })
    }

    fn agent(service: Arc<Scripted>, tools: ToolRegistry) -> (AgentLoop, Arc<ContextManager>) {
        let context = Arc::new(ContextManager::new(OptimizationConfig::with_max_tokens(10_000)));
        let config = AgentConfig::default()
            .with_system_prompt("You are a test agent.")
            .with_retry(RetryPolicy::none());
        let agent = AgentLoop::new(service, Arc::new(tools), context.clone(), config);
        (agent, context)
    }

    #[tokio::test]
    async fn end_turn_finishes_immediately() {
        let service = Scripted::new(vec![Ok(text("all done", StopReason::EndTurn))]);
        let (agent, _) = agent(service.clone(), ToolRegistry::new());

        let response = agent.run(AgentRequest::new("s1", "hello")).await.unwrap();
        assert_eq!(response.content, "all done");
        assert!(response.complete);
        assert_eq!(response.state, RunState::Done);
        assert_eq!(response.iterations, 1);
        assert_eq!(response.usage.total(), 110);
        assert!(response.estimated_cost_usd > 0.0);
        assert_eq!(response.messages.len(), 2);
    }

    #[tokio::test]
    async fn tool_calls_run_in_order_and_feed_back() {
        let service = Scripted::new(vec![
            Ok(calls(vec![
                ToolCall::new("c1", "echo", r#"{"text": "one"}"#),
                ToolCall::new("c2", "echo", r#"{"text": "two"}"#),
            ])),
            Ok(text("finished", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service.clone(), ToolRegistry::new().with(echo()));

        let response = agent.run(AgentRequest::new("s1", "echo twice")).await.unwrap();
        let outputs: Vec<_> = response.tool_executions.iter().map(|e| e.output.as_str()).collect();
        assert_eq!(outputs, vec!["echo: one", "echo: two"]);
        assert_eq!(response.iterations, 2);

        let second = &service.requests()[1];
        let tool_msgs: Vec<_> = second
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_msgs, vec!["c1", "c2"]);
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn tool_errors_become_results_not_failures() {
        let service = Scripted::new(vec![
            Ok(calls(vec![
                ToolCall::new("c1", "missing", "{}"),
                ToolCall::new("c2", "echo", r#"{"wrong": 1}"#),
            ])),
            Ok(text("recovered", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service, ToolRegistry::new().with(echo()));

        let response = agent.run(AgentRequest::new("s1", "try")).await.unwrap();
        assert!(response.complete);
        let execs = &response.tool_executions;
        assert!(!execs[0].success);
        assert!(execs[0].output.contains("unknown tool 'missing'"));
        assert!(!execs[1].success);
        assert!(execs[1].output.contains("missing required field 'text'"));
    }

    #[tokio::test]
    async fn unexpected_stop_is_partial_done() {
        let service = Scripted::new(vec![Ok(text("cut off", StopReason::MaxTokens))]);
        let (agent, _) = agent(service, ToolRegistry::new());
        let response = agent.run(AgentRequest::new("s1", "long task")).await.unwrap();
        assert_eq!(response.state, RunState::Done);
        assert!(!response.complete);
        assert_eq!(response.content, "cut off");
    }

    #[tokio::test]
    async fn iteration_limit_is_exhausted_with_partial() {
        let replies = (0..5)
            .map(|i| Ok(calls(vec![ToolCall::new(format!("c{i}"), "echo", r#"{"text": "x"}"#)])))
            .collect();
        let service = Scripted::new(replies);
        let (agent, _) = agent(service, ToolRegistry::new().with(echo()));
        let agent = AgentLoop {
            config: agent.config.clone().with_max_iterations(3),
            ..agent
        };

        let failure = agent.run(AgentRequest::new("s1", "loop")).await.unwrap_err();
        assert!(failure.error.is(ErrorCode::MaxIterations));
        assert_eq!(failure.partial.state, RunState::Exhausted);
        assert_eq!(failure.partial.iterations, 3);
        assert_eq!(failure.partial.tool_executions.len(), 3);
    }

    #[tokio::test]
    async fn completion_failure_aborts_with_provider_error() {
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "echo", r#"{"text": "x"}"#)])),
            Err(Error::auth_failed("HTTP 401")),
        ]);
        let (agent, _) = agent(service, ToolRegistry::new().with(echo()));
        let failure = agent.run(AgentRequest::new("s1", "go")).await.unwrap_err();
        assert!(failure.error.is(ErrorCode::AuthFailed));
        assert!(!failure.error.is_retryable());
        assert_eq!(failure.partial.state, RunState::Failed);
        assert_eq!(failure.partial.tool_executions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let service = Scripted::new(vec![
            Err(Error::new(ErrorCode::Unavailable, "HTTP 503")),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service.clone(), ToolRegistry::new());
        let agent = AgentLoop {
            config: agent
                .config
                .clone()
                .with_retry(RetryPolicy::default().without_jitter()),
            ..agent
        };
        let response = agent.run(AgentRequest::new("s1", "go")).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(service.requests().len(), 2);
    }

    #[tokio::test]
    async fn consecutive_tool_failures_abort() {
        let replies = (0..5)
            .map(|i| Ok(calls(vec![ToolCall::new(format!("c{i}"), "broken", "{}")])))
            .collect();
        let service = Scripted::new(replies);
        let (agent, _) = agent(service, ToolRegistry::new().with(failing()));
        let failure = agent.run(AgentRequest::new("s1", "break")).await.unwrap_err();
        assert!(failure.error.is(ErrorCode::TooManyErrors));
        assert_eq!(failure.partial.tool_executions.len(), 3);
    }

    #[tokio::test]
    async fn denied_permission_is_reported_to_model() {
        let writer = FnTool::new("write", "Write", ParamSchema::new(), |_| async {
            Ok("written".to_string())
        })
        .requires(Capability::Write);
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "write", "{}")])),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service, ToolRegistry::new().with(writer));
        let agent = agent.with_permissions(Arc::new(CapabilityPolicy::read_only()));

        let response = agent.run(AgentRequest::new("s1", "write")).await.unwrap();
        let exec = &response.tool_executions[0];
        assert!(!exec.success);
        assert!(exec.output.contains("permission denied"));
    }

    #[tokio::test]
    async fn destructive_tool_takes_auto_checkpoint() {
        let store = Arc::new(InMemorySessionStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(store.clone()));
        let deleter = FnTool::new("delete_file", "Delete", ParamSchema::new(), |_| async {
            Ok("deleted".to_string())
        })
        .destructive();
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "delete_file", "{}")])),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service, ToolRegistry::new().with(deleter));
        let agent = agent.with_checkpoints(checkpoints.clone());

        agent.run(AgentRequest::new("s1", "clean up")).await.unwrap();
        let list = checkpoints.list_checkpoints("s1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].name.starts_with("auto_delete_file_"));
        assert_eq!(list[0].messages[0], Message::user("clean up"));
    }

    #[tokio::test]
    async fn failure_streak_does_not_carry_into_next_run() {
        let mut replies: Vec<Result<Completion>> = (0..3)
            .map(|i| Ok(calls(vec![ToolCall::new(format!("c{i}"), "broken", "{}")])))
            .collect();
        replies.push(Ok(calls(vec![ToolCall::new("c3", "broken", "{}")])));
        replies.push(Ok(text("gave up on that tool", StopReason::EndTurn)));
        let service = Scripted::new(replies);
        let (agent, _) = agent(service, ToolRegistry::new().with(failing()));

        let failure = agent.run(AgentRequest::new("s1", "break")).await.unwrap_err();
        assert!(failure.error.is(ErrorCode::TooManyErrors));

        let response = agent.run(AgentRequest::new("s1", "try once more")).await.unwrap();
        assert!(response.complete);
        assert_eq!(response.tool_executions.len(), 1);
        assert!(!response.tool_executions[0].success);
    }

    #[tokio::test]
    async fn retention_cleanup_finishes_before_run_returns() {
        let store = Arc::new(InMemorySessionStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(store).with_keep_last(1));
        let deleter = FnTool::new("delete_file", "Delete", ParamSchema::new(), |_| async {
            Ok("deleted".to_string())
        })
        .destructive();
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "delete_file", "{}")])),
            Ok(calls(vec![ToolCall::new("c2", "delete_file", "{}")])),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let (agent, _) = agent(service, ToolRegistry::new().with(deleter));
        let agent = agent.with_checkpoints(checkpoints.clone());

        agent.run(AgentRequest::new("s1", "clean twice")).await.unwrap();
        let list = checkpoints.list_checkpoints("s1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].name.starts_with("auto_delete_file_"));
    }

    #[tokio::test]
    async fn context_is_injected_and_recorded() {
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "echo", r#"{"text": "x"}"#)])),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let (agent, context) = agent(service.clone(), ToolRegistry::new().with(echo()));
        context
            .add_text("s1", ItemType::Architecture, "hexagonal layout", 1.0)
            .await
            .unwrap();

        agent.run(AgentRequest::new("s1", "do it")).await.unwrap();

        let system = service.requests()[0].system_prompt.clone().unwrap();
        assert!(system.starts_with("You are a test agent."));
        assert!(system.contains("<context>\n[architecture] hexagonal layout\n</context>"));

        let snapshot = context.create_snapshot("s1").await.unwrap();
        let types: Vec<_> = snapshot.items.iter().map(|i| i.item_type).collect();
        assert_eq!(
            types,
            vec![ItemType::Architecture, ItemType::UserIntent, ItemType::ToolResult]
        );
    }

    #[tokio::test]
    async fn explicit_context_skips_lookup() {
        let service = Scripted::new(vec![Ok(text("ok", StopReason::EndTurn))]);
        let (agent, _) = agent(service.clone(), ToolRegistry::new());
        agent
            .run(AgentRequest::new("s1", "go").with_context("[plan] step 1"))
            .await
            .unwrap();
        let system = service.requests()[0].system_prompt.clone().unwrap();
        assert!(system.contains("[plan] step 1"));
    }

    #[tokio::test]
    async fn cancelled_before_first_call() {
        let service = Scripted::new(vec![]);
        let token = CancellationToken::new();
        token.cancel();
        let (agent, _) = agent(service.clone(), ToolRegistry::new());
        let agent = agent.with_cancellation(token);
        let failure = agent.run(AgentRequest::new("s1", "go")).await.unwrap_err();
        assert!(failure.error.is(ErrorCode::Cancelled));
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn transcript_is_persisted() {
        let store = Arc::new(InMemorySessionStore::new());
        let service = Scripted::new(vec![Ok(text("done", StopReason::EndTurn))]);
        let (agent, _) = agent(service, ToolRegistry::new());
        let agent = agent.with_store(store.clone());

        agent.run(AgentRequest::new("s1", "persist me")).await.unwrap();
        let record = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.message_preview, "persist me");
        assert_eq!(record.total_prompt_tokens, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_as_tool_error() {
        let slow = FnTool::new("slow", "Slow", ParamSchema::new(), |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        });
        let service = Scripted::new(vec![
            Ok(calls(vec![ToolCall::new("c1", "slow", "")])),
            Ok(text("ok", StopReason::EndTurn)),
        ]);
        let tools = ToolRegistry::new()
            .with(slow)
            .with_timeout(Duration::from_secs(1));
        let (agent, _) = agent(service, tools);
        let response = agent.run(AgentRequest::new("s1", "wait")).await.unwrap();
        let output = &response.tool_executions[0].output;
        assert!(output.starts_with("Error: tool 'slow' failed"), "{output}");
        assert!(output.contains("timed out"));
    }
}
