//! Retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] is plain data. [`RetryExecutor`] applies it to an async
//! operation: retryable failures are retried until `max_attempts` total
//! attempts have run, non-retryable ones return immediately, and every
//! backoff sleep can be cut short by a [`CancellationToken`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};

/// Maximum relative jitter applied to a backoff delay.
pub const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Perturb each delay by up to ±20%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (0 is the wait after the first
    /// failed attempt).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);
        if self.jitter {
            let factor = 1.0 + JITTER_FRACTION * (2.0 * jitter_unit() - 1.0);
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Uniform value in `[0, 1)` from the low 53 random bits of a v4 UUID.
fn jitter_unit() -> f64 {
    const MANTISSA: u128 = (1 << 53) - 1;
    let bits = uuid::Uuid::new_v4().as_u128() & MANTISSA;
    bits as f64 / (1u64 << 53) as f64
}

/// Information handed to the retry callback before each backoff sleep.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a Error,
}

type RetryCallback = Arc<dyn Fn(&RetryAttempt<'_>) + Send + Sync>;

/// Applies a [`RetryPolicy`] to async operations.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: Option<CancellationToken>,
    on_retry: Option<RetryCallback>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: None,
            on_retry: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_retry(mut self, callback: impl Fn(&RetryAttempt<'_>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Exhaustion yields a
    /// `retries_exhausted` error that reports the attempt count and wraps
    /// the last failure.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= max_attempts {
                return Err(exhausted(attempt, error));
            }
            if self.is_cancelled() {
                return Err(Error::cancelled().with_source(error));
            }

            let delay = self.policy.delay_for_retry(attempt - 1);
            warn!(
                "Attempt {}/{} failed ({}), retrying in {:.1}s",
                attempt,
                max_attempts,
                error,
                delay.as_secs_f64()
            );
            if let Some(cb) = &self.on_retry {
                cb(&RetryAttempt {
                    attempt,
                    max_attempts,
                    delay,
                    error: &error,
                });
            }

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(Error::cancelled().with_source(error));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

fn exhausted(attempts: u32, last: Error) -> Error {
    let mut err = Error::new(
        ErrorCode::RetriesExhausted,
        format!("operation failed after {attempts} attempts: {last}"),
    )
    .with_retryable(false);
    if let Some(user) = last.user_message() {
        err = err.with_user_message(user.to_string());
    }
    err.with_source(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(p.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(p.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(p.delay_for_retry(3), Duration::from_secs(5));
        assert_eq!(p.delay_for_retry(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let p = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..200 {
            let d = p.delay_for_retry(2).as_secs_f64();
            assert!((3.2..=4.8).contains(&d), "delay {d} outside ±20% of 4s");
        }
    }

    #[test]
    fn jitter_unit_is_in_range_and_varies() {
        let samples: Vec<f64> = (0..64).map(|_| jitter_unit()).collect();
        assert!(samples.iter().all(|u| (0.0..1.0).contains(u)));
        assert!(samples.windows(2).any(|w| w[0] != w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let err = RetryExecutor::new(policy())
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::new(ErrorCode::Unavailable, "HTTP 503")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.is(ErrorCode::RetriesExhausted));
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.has_cause(ErrorCode::Unavailable));
        assert!(!err.is_retryable());
        // 1s + 2s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let err = RetryExecutor::new(policy())
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::auth_failed("HTTP 401")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.is(ErrorCode::AuthFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let seen = Mutex::new(Vec::new());
        let value = RetryExecutor::new(policy())
            .on_retry(|_| {})
            .run(|attempt| {
                seen.lock().unwrap().push(attempt);
                async move {
                    if attempt < 2 {
                        Err(Error::internal("connection reset by peer"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_sees_each_retry() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let sink = delays.clone();
        let _ = RetryExecutor::new(policy())
            .on_retry(move |a| sink.lock().unwrap().push((a.attempt, a.delay)))
            .run(|_| async { Err::<(), _>(Error::rate_limited("429")) })
            .await;
        assert_eq!(
            *delays.lock().unwrap(),
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preempts_backoff_sleep() {
        let token = CancellationToken::new();
        let executor = RetryExecutor::new(RetryPolicy {
            initial_delay: Duration::from_secs(60),
            ..policy()
        })
        .with_cancellation(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };
        let started = tokio::time::Instant::now();
        let err = executor
            .run(|_| async { Err::<(), _>(Error::new(ErrorCode::Timeout, "timed out")) })
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.is(ErrorCode::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = RetryExecutor::new(policy().with_max_attempts(0))
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::new(ErrorCode::Transient, "blip")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
