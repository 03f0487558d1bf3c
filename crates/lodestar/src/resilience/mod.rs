//! Failure handling for calls to unreliable dependencies.
//!
//! - [`breaker`]: per-key [`CircuitBreaker`] (Closed / Open / Half-Open).
//! - [`retry`]: [`RetryPolicy`] and the cancellable [`RetryExecutor`].
//! - [`recovery`]: [`ErrorRecovery`], consecutive-error counting plus the
//!   breaker registry shared by concurrent agent loops.

pub mod breaker;
pub mod recovery;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use recovery::ErrorRecovery;
pub use retry::{RetryAttempt, RetryExecutor, RetryPolicy};
