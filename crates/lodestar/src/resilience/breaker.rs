//! Per-dependency circuit breaker.
//!
//! Closed passes calls through and counts consecutive failures. Reaching
//! `max_failures` opens the circuit: calls are rejected without touching the
//! dependency until `reset_timeout` has passed since the last failure. The
//! next call then runs as the single Half-Open probe. A successful probe
//! closes the circuit and zeroes the count; a failed one reopens it.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Healthy: calls allowed.
    Closed,
    /// Tripped: calls rejected until the reset timeout expires.
    Open,
    /// Probing: one call allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Time after the last failure before a probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure gate for one dependency key.
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_error(&self) -> Error {
        Error::new(
            ErrorCode::BreakerOpen,
            format!("circuit breaker open for {}", self.key),
        )
        .with_user_message("The model provider is failing repeatedly; retry later.")
    }

    /// Ask permission to call the dependency.
    ///
    /// Transitions Open to Half-Open once the reset timeout has elapsed. While
    /// a probe is in flight every other caller is rejected.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.config.reset_timeout, |t| t.elapsed());
                if elapsed >= self.config.reset_timeout {
                    info!("Circuit breaker {} half-open, allowing probe", self.key);
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker {} closed after successful probe", self.key);
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Circuit breaker {} probe failed, reopening", self.key);
                inner.state = BreakerState::Open;
                inner.probe_in_flight = false;
            }
            BreakerState::Closed if inner.failure_count >= self.config.max_failures => {
                warn!(
                    "Circuit breaker {} opened after {} consecutive failures",
                    self.key, inner.failure_count
                );
                inner.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Release a probe slot whose call never reported an outcome.
    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        guard.settled = true;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }
}

/// Frees the Half-Open slot if the wrapped future is dropped mid-flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon_probe();
        }
    }
}
