//! Recovery configuration.
//!
//! Defines retry policies, circuit breaker thresholds, batch limits and
//! health-check cadence. Durations serialize as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, OperationError, RecoveryError, RecoveryResult};

/// Orchestrator-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Default retry policy.
    pub retry: RetryConfig,

    /// Circuit breaker parameters applied to every breaker the orchestrator creates.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default batch behavior.
    pub batch: BatchConfig,

    /// Default health-check cadence.
    pub health_check: HealthCheckConfig,
}

impl RecoveryConfig {
    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields take their defaults.
    pub fn from_json(json: &str) -> RecoveryResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RecoveryError::Configuration(format!("invalid recovery config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> RecoveryResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.batch.validate()?;
        self.health_check.validate()
    }
}

/// Backoff curve used between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time.
    Fixed,
    /// Delay grows by `base_delay` per attempt.
    Linear,
    /// Delay doubles per attempt, capped.
    Exponential,
    /// Exponential with up to 10% positive jitter, capped.
    ExponentialJittered,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::Fixed => write!(f, "fixed"),
            RetryStrategy::Linear => write!(f, "linear"),
            RetryStrategy::Exponential => write!(f, "exponential"),
            RetryStrategy::ExponentialJittered => write!(f, "exponential-jittered"),
        }
    }
}

/// Retry policy for a single `execute_with_retry` call.
///
/// `strategy`, `max_attempts` and `base_delay` are captured by the retry state
/// the first time an operation id is seen; later calls with the same id reuse
/// the captured values until a success evicts the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff curve.
    pub strategy: RetryStrategy,

    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,

    /// Base delay for the backoff curve.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// If set, only these kinds are retried.
    pub retryable_kinds: Option<Vec<ErrorKind>>,

    /// If set, these kinds are never retried. Checked before `retryable_kinds`.
    pub non_retryable_kinds: Option<Vec<ErrorKind>>,

    /// Consult and update the circuit breaker for this operation id.
    pub use_circuit_breaker: bool,

    /// Per-attempt timeout.
    #[serde(with = "option_duration_ms")]
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ExponentialJittered,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            retryable_kinds: None,
            non_retryable_kinds: None,
            use_circuit_breaker: true,
            timeout: None,
        }
    }
}

impl RetryConfig {
    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set a per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry only on these kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Never retry on these kinds.
    pub fn never_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.non_retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Bypass the circuit breaker.
    pub fn without_circuit_breaker(mut self) -> Self {
        self.use_circuit_breaker = false;
        self
    }

    /// Classify an error.
    ///
    /// Order: an explicit non-retryable list wins, then an explicit retryable
    /// list decides alone, otherwise only network-shaped errors are retried.
    pub fn is_retryable(&self, error: &OperationError) -> bool {
        if let Some(kinds) = &self.non_retryable_kinds {
            if error.matches_any(kinds) {
                return false;
            }
        }
        match &self.retryable_kinds {
            Some(kinds) => error.matches_any(kinds),
            None => error.is_network(),
        }
    }

    /// Validate the policy.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.max_attempts == 0 {
            return Err(RecoveryError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(RecoveryError::Configuration(
                "retry timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures that opens the circuit.
    pub failure_threshold: u32,

    /// Time after the last failure before an open circuit reports half-open.
    #[serde(with = "duration_ms")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            open_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the thresholds.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.failure_threshold == 0 {
            return Err(RecoveryError::Configuration(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum operations in flight. `None` means `min(count, 10)`.
    pub concurrency: Option<usize>,

    /// Keep going after individual failures and collect them.
    pub continue_on_error: bool,

    /// Retry policy applied to each operation.
    pub retry: RetryConfig,
}

/// Default concurrency ceiling for batches.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            continue_on_error: true,
            retry: RetryConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Set the concurrency limit.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Fail the whole batch at the first failure.
    pub fn fail_fast(mut self) -> Self {
        self.continue_on_error = false;
        self
    }

    /// Set the per-operation retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Concurrency limit for a batch of `count` operations.
    pub fn effective_concurrency(&self, count: usize) -> usize {
        self.concurrency
            .unwrap_or_else(|| count.min(DEFAULT_BATCH_CONCURRENCY))
            .max(1)
    }

    /// Validate the batch settings.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.concurrency == Some(0) {
            return Err(RecoveryError::Configuration(
                "batch concurrency must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Health-check polling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Interval between health checks.
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Consecutive failures that raise a health-check failure.
    pub failure_threshold: u32,

    /// Optional timeout for a single check. A check that times out counts as failed.
    #[serde(with = "option_duration_ms")]
    pub check_timeout: Option<Duration>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            check_timeout: None,
        }
    }
}

impl HealthCheckConfig {
    /// Validate the cadence.
    pub fn validate(&self) -> RecoveryResult<()> {
        if self.interval.is_zero() {
            return Err(RecoveryError::Configuration(
                "health check interval must be greater than zero".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(RecoveryError::Configuration(
                "health check failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fallback trigger configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// If set, only failures of these kinds trigger the fallback.
    pub trigger_kinds: Option<Vec<ErrorKind>>,
}

impl FallbackConfig {
    /// Trigger the fallback only for these kinds.
    pub fn on_kinds(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            trigger_kinds: Some(kinds.into_iter().collect()),
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
