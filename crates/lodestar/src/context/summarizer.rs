//! Summarization backends used by the summarization strategies.
//!
//! [`Summarizer`] is the boundary to whatever produces summaries.
//! [`CompletionSummarizer`] asks a completion model for a compressed
//! rewrite. [`TruncatingSummarizer`] needs no network access: it keeps the
//! head and tail of the content and elides the middle.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::item::DEFAULT_CHARS_PER_TOKEN;
use crate::Message;
use crate::api::{CompletionRequest, CompletionService};
use crate::error::{Error, ErrorCode, Result};

/// Instructions for compressing a single working-memory item.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following content concisely so it can replace the original in an \
agent's working memory. Focus on:
- What was accomplished or decided
- Key findings, including failed approaches and why they failed
- File paths, function names and error messages (verbatim)
- Anything that remains to be done

Rules:
- Only include facts explicitly stated in the content. Do not infer or extrapolate.
- Stay within the requested length. Every token must earn its place.
- Output the summary only, with no preamble.";

/// Produces a shorter rendition of a piece of content.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `content` to roughly `target_tokens` tokens.
    async fn summarize(&self, content: &str, target_tokens: usize) -> Result<String>;
}

// ── Completion-backed ──

/// Summarizes through a completion model.
pub struct CompletionSummarizer {
    service: Arc<dyn CompletionService>,
    model: String,
}

impl CompletionSummarizer {
    pub fn new(service: Arc<dyn CompletionService>, model: impl Into<String>) -> Self {
        Self {
            service,
            model: model.into(),
        }
    }

    fn build_request(&self, content: &str, target_tokens: usize) -> CompletionRequest {
        let user = format!("Target length: about {target_tokens} tokens.\n\n=== CONTENT ===\n{content}");
        // Headroom over the target so the model is not cut off mid-sentence.
        let max_tokens = (target_tokens + target_tokens / 4).max(64) as u32;
        CompletionRequest::new(self.model.clone(), vec![Message::user(user)])
            .with_system_prompt(SUMMARIZATION_PROMPT)
            .with_max_tokens(max_tokens)
            .with_temperature(0.0)
    }
}

#[async_trait]
impl Summarizer for CompletionSummarizer {
    async fn summarize(&self, content: &str, target_tokens: usize) -> Result<String> {
        let request = self.build_request(content, target_tokens);
        let completion = self
            .service
            .create_completion(&request)
            .await
            .map_err(|e| e.context("summarization request failed"))?;

        match completion.content {
            Some(text) if !text.trim().is_empty() => {
                debug!(
                    "Summarized {} chars into {} chars via {}",
                    content.len(),
                    text.len(),
                    self.model
                );
                Ok(text.trim().to_string())
            }
            _ => Err(Error::new(ErrorCode::Internal, "summarizer returned empty output")),
        }
    }
}

// ── Offline fallback ──

/// Keeps the first and last portions of the content within the target size.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncatingSummarizer;

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(&self, content: &str, target_tokens: usize) -> Result<String> {
        Ok(truncate_middle(content, target_tokens))
    }
}

/// Keep roughly `target_tokens` worth of characters, split between the head
/// and the tail, joined by an elision marker.
pub fn truncate_middle(content: &str, target_tokens: usize) -> String {
    let budget = (target_tokens as f64 * DEFAULT_CHARS_PER_TOKEN) as usize;
    let total = content.chars().count();
    if total <= budget {
        return content.to_string();
    }
    let head_len = budget * 2 / 3;
    let tail_len = budget - head_len;
    let head: String = content.chars().take(head_len).collect();
    let tail: String = content.chars().skip(total - tail_len).collect();
    format!(
        "{head}\n[... {} chars elided ...]\n{tail}",
        total - head_len - tail_len
    )
}
