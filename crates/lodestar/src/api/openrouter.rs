//! [`CompletionService`] adapter for the OpenRouter chat completions API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Completion, CompletionRequest, CompletionService, StopReason, Usage};
use crate::error::{Error, ErrorCode, Result};
use crate::{Message, ToolCall, ToolDef};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for OpenRouter.
pub struct OpenRouterService {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
    url: String,
}

impl OpenRouterService {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_headers(api_key, "https://github.com/lodestar-rs/lodestar", "lodestar")
    }

    /// Read the key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| Error::config(format!("{API_KEY_ENV} is not set")))?;
        Self::new(key)
    }

    /// Custom `HTTP-Referer` and `X-Title` attribution headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lodestar/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")).with_source(e))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
            url: OPENROUTER_URL.to_string(),
        })
    }

    /// Point at a different endpoint (e.g. a local proxy).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn build_body<'a>(request: &'a CompletionRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(request.messages.iter().cloned());
        ChatRequest {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: &request.tools,
        }
    }
}

/// Classify a non-success HTTP response.
fn error_for_status(status: StatusCode, body: &str) -> Error {
    let message = format!("OpenRouter API HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        429 => Error::rate_limited(message),
        402 => Error::quota_exceeded(message),
        401 | 403 => Error::auth_failed(message),
        408 => Error::new(ErrorCode::Timeout, message),
        400 | 404 | 422 => Error::new(ErrorCode::InvalidRequest, message).with_retryable(false),
        s if s >= 500 => Error::new(ErrorCode::Unavailable, message),
        _ => Error::new(ErrorCode::Internal, message),
    }
}

fn error_for_transport(e: reqwest::Error) -> Error {
    let code = if e.is_timeout() {
        ErrorCode::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorCode::Transient
    } else {
        ErrorCode::Internal
    };
    Error::new(code, format!("request failed: {e}")).with_source(e)
}

/// Errors embedded in a 200 response body.
fn error_for_body(err: ApiErrorResponse) -> Error {
    let message = format!("OpenRouter API error: {}", err.message);
    match err.code.as_ref().and_then(serde_json::Value::as_u64) {
        Some(code) => match StatusCode::from_u16(code as u16) {
            Ok(status) => error_for_status(status, &err.message),
            Err(_) => Error::internal(message),
        },
        None => Error::internal(message),
    }
}

#[async_trait]
impl CompletionService for OpenRouterService {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn create_completion(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = Self::build_body(request);
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={}",
            request.model,
            body.messages.len(),
            request.tools.len(),
            request.max_tokens,
            request.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(error_for_transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(error_for_transport)?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }
        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<Completion> {
    let parsed: RawChatResponse = serde_json::from_str(text)
        .map_err(|e| Error::from(e).context("failed to parse completion response"))?;

    if let Some(err) = parsed.error {
        return Err(error_for_body(err));
    }

    let usage = parsed
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
        })
        .unwrap_or_default();

    let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
        debug!("LLM output: empty (no choices)");
        return Ok(Completion {
            content: None,
            tool_calls: vec![],
            stop_reason: StopReason::Other("no_choices".into()),
            usage,
        });
    };

    let tool_calls = choice.message.tool_calls.unwrap_or_default();
    debug!(
        "LLM output: {} chars text, {} tool call(s), finish_reason={:?}",
        choice.message.content.as_ref().map_or(0, |s| s.len()),
        tool_calls.len(),
        choice.finish_reason
    );
    Ok(Completion {
        content: choice.message.content,
        tool_calls,
        stop_reason: StopReason::from_finish_reason(choice.finish_reason.as_deref()),
        usage,
    })
}
