//! Consecutive-failure bookkeeping and the per-dependency breaker registry.
//!
//! One [`ErrorRecovery`] is shared by every agent loop in a process. Loops
//! report outcomes per session; the counter tells a loop when to stop
//! iterating. Breakers are keyed by dependency (normally the provider name)
//! and created on first use, so loops talking to the same provider share
//! one breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};

pub struct ErrorRecovery {
    max_consecutive_errors: u32,
    breaker_config: BreakerConfig,
    consecutive: Mutex<HashMap<String, u32>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new(3, BreakerConfig::default())
    }
}

impl ErrorRecovery {
    pub fn new(max_consecutive_errors: u32, breaker_config: BreakerConfig) -> Self {
        Self {
            max_consecutive_errors: max_consecutive_errors.max(1),
            breaker_config,
            consecutive: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_consecutive_errors(&self) -> u32 {
        self.max_consecutive_errors
    }

    /// Count a failure for `session`. Returns true once the configured
    /// maximum of consecutive errors has been reached.
    pub fn record_error(&self, session: &str) -> bool {
        let mut counts = self.consecutive.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(session.to_string()).or_insert(0);
        *count += 1;
        let exhausted = *count >= self.max_consecutive_errors;
        if exhausted {
            warn!(
                "Session {} reached {} consecutive errors",
                session, *count
            );
        } else {
            debug!("Session {} consecutive errors: {}", session, *count);
        }
        exhausted
    }

    pub fn record_success(&self, session: &str) {
        let mut counts = self.consecutive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(session) {
            *count = 0;
        }
    }

    pub fn consecutive_errors(&self, session: &str) -> u32 {
        self.consecutive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .copied()
            .unwrap_or(0)
    }

    /// Forget a session's counter (on session end).
    pub fn reset(&self, session: &str) {
        self.consecutive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
    }

    /// The breaker for `key`, created on first request.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Creating circuit breaker for {}", key);
                Arc::new(CircuitBreaker::new(key, self.breaker_config.clone()))
            })
            .clone()
    }
}
