//! Completion service boundary.
//!
//! The agent loop and the summarizer talk to models only through
//! [`CompletionService`]. Adapters translate provider wire formats and
//! provider failures into [`Completion`] values and coded [`Error`]s whose
//! [`is_retryable`](Error::is_retryable) answer drives the retry layer.
//!
//! - [`openrouter`]: adapter for the OpenRouter chat completions API.
//! - [`pricing`]: per-model pricing tables and cumulative [`CostTracker`].

pub mod openrouter;
pub mod pricing;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{Message, ToolCall, ToolDef};

pub use openrouter::OpenRouterService;
pub use pricing::{CostTracker, ModelPricing, generate_trace_id, pricing_for_model};

/// Parameters of one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.3,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    StopSequence,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    /// Map both OpenAI-style (`stop`, `tool_calls`, `length`) and
    /// Anthropic-style (`end_turn`, `tool_use`, `max_tokens`) finish reasons.
    pub fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | Some("end_turn") => StopReason::EndTurn,
            Some("stop_sequence") => StopReason::StopSequence,
            Some("tool_calls") | Some("tool_use") | Some("function_call") => StopReason::ToolUse,
            Some("length") | Some("max_tokens") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.to_string()),
            None => StopReason::Other("unknown".into()),
        }
    }
}

/// Token usage for one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Result of one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// One increment of a streamed completion. A stream ends with `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    Done(Usage),
}

/// A model backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Stable provider key; the agent loop keys its circuit breaker on it.
    fn name(&self) -> &str;

    async fn create_completion(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Stream incremental text ending in a usage record. The default
    /// implementation emits the whole completion as a single delta.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<StreamChunk>>> {
        let completion = self.create_completion(request).await?;
        let mut chunks = Vec::new();
        if let Some(text) = completion.content
            && !text.is_empty()
        {
            chunks.push(Ok(StreamChunk::TextDelta(text)));
        }
        chunks.push(Ok(StreamChunk::Done(completion.usage)));
        Ok(stream::iter(chunks).boxed())
    }
}

/// Fold a stream back into its text and final usage.
pub async fn collect_stream(
    mut stream: BoxStream<'static, Result<StreamChunk>>,
) -> Result<(String, Usage)> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta(delta) => text.push_str(&delta),
            StreamChunk::Done(usage) => return Ok((text, usage)),
        }
    }
    Err(Error::internal("stream ended without a usage record").with_retryable(true))
}
