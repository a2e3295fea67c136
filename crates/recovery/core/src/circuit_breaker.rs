//! Circuit breaker for operation identifiers.
//!
//! Fails fast once an operation is chronically unhealthy. The open to
//! half-open transition is evaluated lazily whenever the state is read;
//! there is no timer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,

    /// Requests are refused.
    Open,

    /// Open timeout elapsed. Advisory only: requests are admitted and the
    /// next outcome decides where the breaker goes.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

/// Circuit breaker for a single operation identifier.
///
/// Transitions:
/// - Closed -> Open once `failure_count >= failure_threshold`
/// - Open -> HalfOpen on read, once `open_timeout` has passed since the last failure
/// - any -> Closed on success or manual reset
pub struct CircuitBreaker {
    operation_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for an operation.
    pub fn new(operation_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            operation_id: operation_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                last_failure_time: None,
            }),
        }
    }

    /// Get the operation id.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state, applying the open timeout first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Check if a request should be admitted. Only an open breaker refuses.
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Number of failures recorded since the last success or reset.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(
                operation_id = %self.operation_id,
                previous = %inner.state,
                "Circuit breaker closing after success"
            );
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());

        if inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    operation_id = %self.operation_id,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opening due to failures"
                );
            }
            inner.state = CircuitState::Open;
        } else {
            debug!(
                operation_id = %self.operation_id,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                "Circuit breaker recorded failure"
            );
        }
    }

    /// Force the breaker closed and forget its failure history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(
            operation_id = %self.operation_id,
            old_state = %inner.state,
            "Circuit breaker reset"
        );
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.last_failure_time = None;
    }

    /// Snapshot of the breaker.
    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitBreakerStatus {
            operation_id: self.operation_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_time: inner.last_failure_time,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(last_failure) = inner.last_failure_at else {
            return;
        };
        if last_failure.elapsed() > self.config.open_timeout {
            info!(
                operation_id = %self.operation_id,
                "Circuit breaker transitioning to half-open after timeout"
            );
            inner.state = CircuitState::HalfOpen;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation_id", &self.operation_id)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    /// Operation id.
    pub operation_id: String,

    /// State after applying the open timeout.
    pub state: CircuitState,

    /// Failures since the last success or reset.
    pub failure_count: u32,

    /// Failures that open the breaker.
    pub failure_threshold: u32,

    /// Wall-clock time of the last recorded failure.
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 10,
            open_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("export", test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 10);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_from_any_state() {
        let breaker = CircuitBreaker::new("export", test_config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_manual_reset_clears_history() {
        let breaker = CircuitBreaker::new("export", test_config());
        for _ in 0..12 {
            breaker.record_failure();
        }
        assert!(breaker.status().last_failure_time.is_some());

        breaker.reset();
        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_becomes_half_open_on_read() {
        let breaker = CircuitBreaker::new("export", test_config());
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(300)).await;
        // Not strictly past the timeout yet.
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breaker.status().state, CircuitState::HalfOpen);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "export",
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_millis(100),
            },
        );
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
    }
}
