//! Crate-wide error type.
//!
//! Every fallible operation returns [`Error`], which carries a stable
//! [`ErrorCode`] for programmatic matching, a human-readable message, an
//! optional message meant for end users, and an optional wrapped cause.
//! Callers branch on [`Error::is`] and [`Error::is_retryable`] instead of
//! inspecting concrete error types.

use std::fmt;

use thiserror::Error;

/// Boxed cause carried by [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable error codes. The string form (see [`ErrorCode::as_str`]) is part of
/// the public surface and never changes between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Validation: never retried.
    UnknownSession,
    InvalidArguments,
    NotFound,
    DuplicateItem,
    // Transient backend failures.
    Transient,
    Timeout,
    RateLimited,
    Unavailable,
    // Permanent backend failures.
    AuthFailed,
    QuotaExceeded,
    InvalidRequest,
    // Resilience layer.
    BreakerOpen,
    RetriesExhausted,
    // Agent loop.
    MaxIterations,
    TooManyErrors,
    ToolFailed,
    PermissionDenied,
    // Infrastructure.
    Storage,
    Serialization,
    Config,
    Cancelled,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownSession => "unknown_session",
            ErrorCode::InvalidArguments => "invalid_arguments",
            ErrorCode::NotFound => "not_found",
            ErrorCode::DuplicateItem => "duplicate_item",
            ErrorCode::Transient => "transient",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::BreakerOpen => "breaker_open",
            ErrorCode::RetriesExhausted => "retries_exhausted",
            ErrorCode::MaxIterations => "max_iterations",
            ErrorCode::TooManyErrors => "too_many_errors",
            ErrorCode::ToolFailed => "tool_failed",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Storage => "storage",
            ErrorCode::Serialization => "serialization",
            ErrorCode::Config => "config",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        }
    }

    /// Whether errors with this code are retryable absent an explicit flag.
    pub fn retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorCode::Transient
                | ErrorCode::Timeout
                | ErrorCode::RateLimited
                | ErrorCode::Unavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's error value.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
    user_message: Option<String>,
    retryable: Option<bool>,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            user_message: None,
            retryable: None,
            source: None,
        }
    }

    // ── Constructors for common cases ──

    pub fn unknown_session(session_id: &str) -> Self {
        Self::new(
            ErrorCode::UnknownSession,
            format!("unknown session: {session_id}"),
        )
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArguments, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Re-tag a tool's own error. The original stays reachable through
    /// `source` and [`has_cause`](Self::has_cause).
    pub fn tool_failed(tool: &str, cause: Error) -> Self {
        Self {
            code: ErrorCode::ToolFailed,
            message: format!("tool '{tool}' failed: {}", cause.message),
            user_message: cause.user_message.clone(),
            retryable: Some(false),
            source: Some(Box::new(cause)),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
            .with_user_message("The model provider is rate limiting requests; retry later.")
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QuotaExceeded, message)
            .with_user_message("Your provider quota or credit is exhausted; check your plan.")
            .with_retryable(false)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailed, message)
            .with_user_message("The provider rejected the API key; check your credentials.")
            .with_retryable(false)
    }

    // ── Builders ──

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Wrap this error under a new message, keeping its code, retryable
    /// marker and user message. The original becomes the `source`.
    pub fn context(self, message: impl Into<String>) -> Self {
        let message = format!("{}: {}", message.into(), self.message);
        Self {
            code: self.code,
            message,
            user_message: self.user_message.clone(),
            retryable: self.retryable,
            source: Some(Box::new(self)),
        }
    }

    // ── Queries ──

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_message(&self) -> Option<&str> {
        self.user_message.as_deref()
    }

    /// Whether retrying the failed operation might succeed.
    ///
    /// Resolution order: explicit flag, then the code's default, then a
    /// pattern match over the message for well-known transient failures.
    pub fn is_retryable(&self) -> bool {
        if let Some(flag) = self.retryable {
            return flag;
        }
        if self.code.retryable_by_default() {
            return true;
        }
        match self.code {
            ErrorCode::Internal | ErrorCode::Storage => is_transient_message(&self.message),
            _ => false,
        }
    }

    /// Walk the `source` chain looking for a wrapped [`Error`] with `code`.
    pub fn has_cause(&self, code: ErrorCode) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(e) = err.downcast_ref::<Error>()
                && e.code == code
            {
                return true;
            }
            current = err.source();
        }
        false
    }
}

/// Whether an error message describes a transient failure.
pub fn is_transient_message(message: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504"];
    if transient_statuses
        .iter()
        .any(|s| message.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = message.to_lowercase();
    [
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "rate limit",
        "too many requests",
        "unavailable",
        "bad gateway",
        "deadline exceeded",
        "broken pipe",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let retryable = matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
        );
        Error::new(ErrorCode::Storage, format!("I/O error: {e}"))
            .with_retryable(retryable)
            .with_source(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorCode::Serialization, format!("JSON error: {e}")).with_source(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_defaults_drive_retryability() {
        assert!(Error::new(ErrorCode::Timeout, "slow").is_retryable());
        assert!(Error::rate_limited("429").is_retryable());
        assert!(!Error::invalid_arguments("bad").is_retryable());
        assert!(!Error::unknown_session("s1").is_retryable());
    }

    #[test]
    fn explicit_flag_wins() {
        let err = Error::new(ErrorCode::Unavailable, "503").with_retryable(false);
        assert!(!err.is_retryable());
        let err = Error::internal("weird").with_retryable(true);
        assert!(err.is_retryable());
    }

    #[test]
    fn message_patterns_mark_internal_errors_transient() {
        assert!(Error::internal("connection reset by peer").is_retryable());
        assert!(Error::internal("upstream HTTP 502").is_retryable());
        assert!(Error::internal("Deadline exceeded while waiting").is_retryable());
        assert!(!Error::internal("some random error").is_retryable());
    }

    #[test]
    fn permanent_backend_errors_are_not_retryable() {
        let quota = Error::quota_exceeded("402 payment required");
        assert!(!quota.is_retryable());
        assert!(quota.user_message().unwrap().contains("check your plan"));

        let limited = Error::rate_limited("429");
        assert!(limited.user_message().unwrap().contains("retry later"));
    }

    #[test]
    fn context_keeps_code_and_chains_source() {
        let err = Error::rate_limited("HTTP 429").context("completion failed");
        assert!(err.is(ErrorCode::RateLimited));
        assert_eq!(err.message(), "completion failed: HTTP 429");
        assert!(err.user_message().is_some());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn tool_failed_retags_but_keeps_cause() {
        let cause = Error::new(ErrorCode::Timeout, "timed out after 1s");
        let err = Error::tool_failed("slow", cause);
        assert!(err.is(ErrorCode::ToolFailed));
        assert_eq!(err.message(), "tool 'slow' failed: timed out after 1s");
        assert!(!err.is_retryable());
        assert!(err.has_cause(ErrorCode::Timeout));
    }

    #[test]
    fn has_cause_walks_chain() {
        let inner = Error::new(ErrorCode::Timeout, "timed out");
        let outer = Error::new(ErrorCode::RetriesExhausted, "gave up").with_source(inner);
        assert!(outer.has_cause(ErrorCode::Timeout));
        assert!(outer.has_cause(ErrorCode::RetriesExhausted));
        assert!(!outer.has_cause(ErrorCode::AuthFailed));
    }

    #[test]
    fn io_errors_map_to_storage() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is(ErrorCode::Storage));
        assert!(!err.is_retryable());
    }
}
