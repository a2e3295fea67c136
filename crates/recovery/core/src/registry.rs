//! Per-operation recovery state.
//!
//! Lifecycle:
//! - retry state is created on first use of an operation id and evicted on success;
//!   the parameters captured at creation win until eviction
//! - circuit breakers are created on first use and persist until the registry is cleared;
//!   manual reset only changes their state

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
use crate::config::{CircuitBreakerConfig, RetryConfig, RetryStrategy};

/// Retry bookkeeping for one operation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Operation id.
    pub operation_id: String,

    /// Attempts allowed.
    pub max_attempts: u32,

    /// Base delay for the backoff curve.
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,

    /// Backoff curve.
    pub strategy: RetryStrategy,

    /// Attempt currently running (0 before the first attempt).
    pub current_attempt: u32,
}

impl RetryState {
    /// Capture the policy parameters from `config`.
    pub fn new(operation_id: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            operation_id: operation_id.into(),
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            strategy: config.strategy,
            current_attempt: 0,
        }
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.strategy.delay_for_attempt(attempt, self.base_delay)
    }
}

/// Aggregate counters over the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Circuit breakers tracked.
    pub tracked_breakers: usize,

    /// Breakers currently open.
    pub open_breakers: usize,

    /// Operations with live retry state.
    pub active_retry_states: usize,
}

/// Registry of retry state and circuit breakers keyed by operation id.
///
/// Map guards are never held across an await point.
pub struct RecoveryRegistry {
    breaker_config: CircuitBreakerConfig,
    retry_states: DashMap<String, RetryState>,
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl RecoveryRegistry {
    /// Create an empty registry.
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breaker_config,
            retry_states: DashMap::new(),
            circuit_breakers: DashMap::new(),
        }
    }

    /// Get or create retry state. An existing entry is returned unchanged,
    /// whatever `config` says.
    pub fn retry_state(&self, operation_id: &str, config: &RetryConfig) -> RetryState {
        self.retry_states
            .entry(operation_id.to_string())
            .or_insert_with(|| {
                debug!(operation_id = %operation_id, "Creating retry state");
                RetryState::new(operation_id, config)
            })
            .clone()
    }

    /// Look up retry state without creating it.
    pub fn get_retry_state(&self, operation_id: &str) -> Option<RetryState> {
        self.retry_states.get(operation_id).map(|s| s.clone())
    }

    /// Record the attempt currently running.
    pub fn set_current_attempt(&self, operation_id: &str, attempt: u32) {
        if let Some(mut state) = self.retry_states.get_mut(operation_id) {
            state.current_attempt = attempt;
        }
    }

    /// Evict retry state after a success.
    pub fn clear_retry_state(&self, operation_id: &str) {
        self.retry_states.remove(operation_id);
    }

    /// Get or create the circuit breaker for an operation.
    pub fn circuit_breaker(&self, operation_id: &str) -> Arc<CircuitBreaker> {
        self.circuit_breakers
            .entry(operation_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    operation_id,
                    self.breaker_config.clone(),
                ))
            })
            .clone()
    }

    /// Look up a breaker without creating it.
    pub fn get_circuit_breaker(&self, operation_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers.get(operation_id).map(|b| b.clone())
    }

    /// Status of every tracked breaker.
    pub fn circuit_breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        breakers.iter().map(|breaker| breaker.status()).collect()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> RecoveryStats {
        let statuses = self.circuit_breaker_statuses();
        RecoveryStats {
            tracked_breakers: statuses.len(),
            open_breakers: statuses
                .iter()
                .filter(|status| status.state == CircuitState::Open)
                .count(),
            active_retry_states: self.retry_states.len(),
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.retry_states.clear();
        self.circuit_breakers.clear();
    }
}
