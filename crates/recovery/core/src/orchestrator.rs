//! Recovery orchestrator.
//!
//! The `RecoveryOrchestrator` wraps fallible async operations with retry,
//! deadline, fallback, batch and health-checked strategies. It owns the
//! per-operation retry state and circuit breakers and publishes an
//! [`ErrorEvent`] for every failure, timeout and fallback outcome.
//!
//! Timeouts stop *waiting* for an operation. Work that cannot observe
//! cancellation may keep running after the timeout fires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchError, BatchResult};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::config::{BatchConfig, FallbackConfig, HealthCheckConfig, RecoveryConfig, RetryConfig};
use crate::connectivity::{AlwaysConnected, ConnectivityCheck};
use crate::error::{OperationError, RecoveryError, RecoveryResult};
use crate::events::{ErrorEvent, EventChannel, EventSubscription};
use crate::gate::ConcurrencyGate;
use crate::health::{self, HealthCheckedOutcome};
use crate::registry::{RecoveryRegistry, RecoveryStats, RetryState};

/// Callback invoked when a deadline expires, with the operation id and deadline.
pub type TimeoutCallback = Box<dyn FnOnce(&str, Duration) + Send>;

/// Façade over the recovery strategies.
pub struct RecoveryOrchestrator {
    /// Configuration.
    config: RecoveryConfig,

    /// Retry state and circuit breakers per operation id.
    registry: RecoveryRegistry,

    /// Event fan-out.
    events: EventChannel,

    /// Retry-abort hook for network-shaped failures.
    connectivity: Arc<dyn ConnectivityCheck>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator that never vetoes retries.
    pub fn new(config: RecoveryConfig) -> Self {
        Self::with_connectivity_check(config, Arc::new(AlwaysConnected))
    }

    /// Create an orchestrator with a custom connectivity check.
    pub fn with_connectivity_check(
        config: RecoveryConfig,
        connectivity: Arc<dyn ConnectivityCheck>,
    ) -> Self {
        Self {
            registry: RecoveryRegistry::new(config.circuit_breaker.clone()),
            config,
            events: EventChannel::new(),
            connectivity,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Subscribe to recovery events.
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// `None` uses the orchestrator's `retry` defaults. Retry parameters are
    /// captured the first time `operation_id` is seen and reused until a
    /// success evicts them.
    #[instrument(skip(self, operation, config), fields(operation_id = %operation_id))]
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_id: &str,
        mut operation: F,
        config: Option<&RetryConfig>,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let config = config.unwrap_or(&self.config.retry);
        config.validate()?;

        let state = self.registry.retry_state(operation_id, config);
        let breaker = config
            .use_circuit_breaker
            .then(|| self.registry.circuit_breaker(operation_id));

        let mut attempt = 1;
        loop {
            if let Some(breaker) = &breaker {
                if !breaker.allow_request() {
                    warn!(
                        operation_id = %operation_id,
                        failures = breaker.failure_count(),
                        "Circuit breaker open, refusing operation"
                    );
                    return Err(RecoveryError::CircuitBreakerOpen {
                        operation_id: operation_id.to_string(),
                    });
                }
            }

            self.registry.set_current_attempt(operation_id, attempt);
            debug!(attempt, max_attempts = state.max_attempts, "Running attempt");

            let error = match run_attempt(&mut operation, config.timeout).await {
                Ok(value) => {
                    self.registry.clear_retry_state(operation_id);
                    if let Some(breaker) = &breaker {
                        breaker.record_success();
                    }
                    if attempt > 1 {
                        info!(attempts = attempt, "Operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            self.emit(ErrorEvent::new(
                operation_id,
                attempt,
                state.max_attempts,
                RecoveryError::Operation(error.clone()),
            ));

            if !config.is_retryable(&error) {
                warn!(attempt, error = %error, "Non-retryable failure");
                record_failure(breaker.as_deref());
                return Err(RecoveryError::NonRetryable {
                    operation_id: operation_id.to_string(),
                    source: error,
                });
            }

            if attempt >= state.max_attempts {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                record_failure(breaker.as_deref());
                return Err(RecoveryError::MaxRetriesExceeded {
                    operation_id: operation_id.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = state.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                strategy = %state.strategy,
                error = %error,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;

            if error.is_network() && !self.connectivity.should_retry(operation_id, &error).await {
                warn!(attempt, error = %error, "Retry aborted by connectivity check");
                record_failure(breaker.as_deref());
                return Err(RecoveryError::RetryAborted {
                    operation_id: operation_id.to_string(),
                    attempt,
                    source: error,
                });
            }

            attempt += 1;
        }
    }

    /// Run `operation` with a hard deadline. No retries.
    #[instrument(skip(self, operation, on_timeout), fields(operation_id = %operation_id))]
    pub async fn execute_with_deadline<T, F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
        deadline: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> RecoveryResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        match tokio::time::timeout(deadline, operation()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                debug!(error = %error, "Operation failed before deadline");
                let error = RecoveryError::Operation(error);
                self.emit(ErrorEvent::new(operation_id, 1, 1, error.clone()));
                Err(error)
            }
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Deadline exceeded");
                if let Some(callback) = on_timeout {
                    callback(operation_id, deadline);
                }
                let error = RecoveryError::OperationTimeout {
                    operation_id: operation_id.to_string(),
                    deadline,
                };
                self.emit(ErrorEvent::new(operation_id, 1, 1, error.clone()));
                Err(error)
            }
        }
    }

    /// Run `primary`, falling back to `fallback` when it fails.
    ///
    /// With `config.trigger_kinds` set, other failures propagate unchanged
    /// after emitting an event.
    #[instrument(skip(self, primary, fallback, config), fields(operation_id = %operation_id))]
    pub async fn execute_with_fallback<T, P, PFut, B, BFut>(
        &self,
        operation_id: &str,
        primary: P,
        fallback: B,
        config: &FallbackConfig,
    ) -> RecoveryResult<T>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, OperationError>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, OperationError>>,
    {
        let primary_error = match primary().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if let Some(kinds) = &config.trigger_kinds {
            if !primary_error.matches_any(kinds) {
                debug!(error = %primary_error, "Failure not eligible for fallback");
                let error = RecoveryError::Operation(primary_error);
                self.emit(ErrorEvent::new(operation_id, 1, 1, error.clone()));
                return Err(error);
            }
        }

        info!(error = %primary_error, "Primary failed, running fallback");

        match fallback().await {
            Ok(value) => {
                self.emit(
                    ErrorEvent::new(operation_id, 1, 1, RecoveryError::Operation(primary_error))
                        .recovered(),
                );
                Ok(value)
            }
            Err(fallback_error) => {
                warn!(
                    primary = %primary_error,
                    fallback = %fallback_error,
                    "Fallback failed"
                );
                let error = RecoveryError::FallbackFailed {
                    operation_id: operation_id.to_string(),
                    primary: primary_error,
                    fallback: fallback_error,
                };
                self.emit(ErrorEvent::new(operation_id, 1, 1, error.clone()));
                Err(error)
            }
        }
    }

    /// Run every operation under its own retry policy, at most
    /// `config.effective_concurrency(n)` at a time. `None` uses the
    /// orchestrator's `batch` defaults.
    ///
    /// Operation `i` runs as `"{batch_id}_{i}"`. With `continue_on_error`
    /// the result accounts for every operation; otherwise the first failure
    /// is returned as [`RecoveryError::BatchAborted`] and the remaining
    /// operations are dropped.
    #[instrument(skip(self, operations, config), fields(batch_id = %batch_id))]
    pub async fn execute_batch_with_recovery<T, F, Fut>(
        &self,
        batch_id: &str,
        operations: Vec<F>,
        config: Option<&BatchConfig>,
    ) -> RecoveryResult<BatchResult<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let config = config.unwrap_or(&self.config.batch);
        config.validate()?;

        let total = operations.len();
        let mut result = BatchResult::with_capacity(total);
        if total == 0 {
            return Ok(result);
        }

        let gate = ConcurrencyGate::new(config.effective_concurrency(total))?;
        info!(total, concurrency = gate.capacity(), "Starting batch");

        let gate = &gate;
        let retry = &config.retry;
        let mut pending: FuturesUnordered<_> = operations
            .into_iter()
            .enumerate()
            .map(|(index, operation)| {
                let operation_id = format!("{}_{}", batch_id, index);
                async move {
                    let outcome = match gate.acquire().await {
                        Ok(_permit) => {
                            self.execute_with_retry(&operation_id, operation, Some(retry)).await
                        }
                        Err(error) => Err(error),
                    };
                    (index, operation_id, outcome)
                }
            })
            .collect();

        while let Some((index, operation_id, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => result.push_success(value),
                Err(error) => {
                    let batch_error = BatchError {
                        index,
                        operation_id,
                        error,
                    };
                    if !config.continue_on_error {
                        warn!(index, error = %batch_error.error, "Batch aborted at first failure");
                        return Err(RecoveryError::BatchAborted(Box::new(batch_error)));
                    }
                    result.push_error(batch_error);
                }
            }
        }

        info!(
            successes = result.success_count,
            errors = result.error_count,
            total = result.total_count,
            "Batch completed"
        );
        Ok(result)
    }

    /// Run `operation` while polling `health_check` every `config.interval`.
    ///
    /// Reaching `config.failure_threshold` consecutive check failures raises
    /// `HealthCheckFailed` on the side; the primary keeps running and its
    /// own result is reported unchanged. Polling stops when the primary settles.
    /// `None` uses the orchestrator's `health_check` defaults.
    #[instrument(skip(self, operation, health_check, config), fields(operation_id = %operation_id))]
    pub async fn execute_with_health_check<T, F, Fut, H, HFut>(
        &self,
        operation_id: &str,
        operation: F,
        health_check: H,
        config: Option<&HealthCheckConfig>,
    ) -> HealthCheckedOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        H: FnMut() -> HFut,
        HFut: Future<Output = bool>,
    {
        let config = config.unwrap_or(&self.config.health_check);
        if let Err(error) = config.validate() {
            return HealthCheckedOutcome {
                result: Err(error),
                health_failure: None,
            };
        }

        let primary = operation();
        tokio::pin!(primary);
        let monitor = health::monitor_until_unhealthy(operation_id, health_check, config);
        tokio::pin!(monitor);

        let mut health_failure = None;
        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut primary => break outcome,
                failure = &mut monitor, if health_failure.is_none() => {
                    self.emit(ErrorEvent::new(operation_id, 1, 1, failure.clone()));
                    health_failure = Some(failure);
                }
            }
        };

        let result = outcome.map_err(|error| {
            let error = RecoveryError::Operation(error);
            self.emit(ErrorEvent::new(operation_id, 1, 1, error.clone()));
            error
        });

        HealthCheckedOutcome {
            result,
            health_failure,
        }
    }

    /// Status of the breaker for `operation_id`, if one exists.
    pub fn get_circuit_breaker_status(&self, operation_id: &str) -> Option<CircuitBreakerStatus> {
        self.registry
            .get_circuit_breaker(operation_id)
            .map(|breaker| breaker.status())
    }

    /// Force the breaker for `operation_id` closed. Returns `false` if there
    /// was no breaker.
    pub fn reset_circuit_breaker(&self, operation_id: &str) -> bool {
        match self.registry.get_circuit_breaker(operation_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Status of every tracked breaker.
    pub fn circuit_breaker_statuses(&self) -> Vec<CircuitBreakerStatus> {
        self.registry.circuit_breaker_statuses()
    }

    /// Live retry state for `operation_id`.
    pub fn retry_state(&self, operation_id: &str) -> Option<RetryState> {
        self.registry.get_retry_state(operation_id)
    }

    /// Aggregate registry counters.
    pub fn stats(&self) -> RecoveryStats {
        self.registry.stats()
    }

    /// Close the event channel and drop all retry and breaker state. Idempotent.
    pub fn close(&self) {
        if !self.events.close() {
            return;
        }
        let stats = self.registry.stats();
        info!(
            breakers = stats.tracked_breakers,
            retry_states = stats.active_retry_states,
            "Closing recovery orchestrator"
        );
        self.registry.clear();
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn emit(&self, event: ErrorEvent) {
        self.events.emit(event);
    }
}

impl Default for RecoveryOrchestrator {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

async fn run_attempt<T, F, Fut>(
    operation: &mut F,
    timeout: Option<Duration>,
) -> Result<T, OperationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation())
            .await
            .unwrap_or(Err(OperationError::Timeout(limit))),
        None => operation().await,
    }
}

fn record_failure(breaker: Option<&CircuitBreaker>) {
    if let Some(breaker) = breaker {
        breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::{CircuitBreakerConfig, RetryStrategy};
    use crate::connectivity::ConnectivityFlag;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_strategy(RetryStrategy::Fixed)
            .with_base_delay(Duration::from_millis(100))
            .with_max_attempts(max_attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let orchestrator = RecoveryOrchestrator::default();
        let calls = AtomicU32::new(0);

        let value = orchestrator
            .execute_with_retry(
                "fetch",
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OperationError::Connection("refused".into()))
                    } else {
                        Ok(42)
                    }
                },
                Some(&fixed_retry(3)),
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(orchestrator.retry_state("fetch").is_none());
        let status = orchestrator.get_circuit_breaker_status("fetch").unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_classification_stops_on_application_error() {
        let orchestrator = RecoveryOrchestrator::default();
        let calls = AtomicU32::new(0);

        let err = orchestrator
            .execute_with_retry(
                "validate",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::InvalidInput("bad record".into()))
                },
                Some(&fixed_retry(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::NonRetryable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            orchestrator.get_circuit_breaker_status("validate").unwrap().failure_count,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout_is_retried() {
        let orchestrator = RecoveryOrchestrator::default();
        let calls = AtomicU32::new(0);

        let value = orchestrator
            .execute_with_retry(
                "slow",
                || {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        }
                        Ok("done")
                    }
                },
                Some(&fixed_retry(2).with_timeout(Duration::from_secs(1))),
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_veto_aborts() {
        let flag = Arc::new(ConnectivityFlag::new(false));
        let orchestrator =
            RecoveryOrchestrator::with_connectivity_check(RecoveryConfig::default(), flag.clone());
        let calls = AtomicU32::new(0);

        let err = orchestrator
            .execute_with_retry(
                "upload",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::Socket("reset".into()))
                },
                Some(&fixed_retry(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::RetryAborted { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            orchestrator.get_circuit_breaker_status("upload").unwrap().failure_count,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_not_consulted_for_explicitly_retryable_errors() {
        let flag = Arc::new(ConnectivityFlag::new(false));
        let orchestrator =
            RecoveryOrchestrator::with_connectivity_check(RecoveryConfig::default(), flag);

        let err = orchestrator
            .execute_with_retry(
                "write",
                || async { Err::<(), _>(OperationError::Storage("locked".into())) },
                Some(&fixed_retry(3).retry_on([ErrorKind::Storage])),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::MaxRetriesExceeded { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_refuses_without_attempt() {
        let config = RecoveryConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let orchestrator = RecoveryOrchestrator::new(config);
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(OperationError::Network("down".into()))
        };

        for _ in 0..2 {
            let err = orchestrator
                .execute_with_retry("sync", op, Some(&fixed_retry(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, RecoveryError::MaxRetriesExceeded { .. }));
        }

        let err = orchestrator
            .execute_with_retry("sync", op, Some(&fixed_retry(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::CircuitBreakerOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Bypassing the breaker still runs the operation.
        let err = orchestrator
            .execute_with_retry("sync", op, Some(&fixed_retry(1).without_circuit_breaker()))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::MaxRetriesExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(orchestrator.reset_circuit_breaker("sync"));
        assert!(!orchestrator.reset_circuit_breaker("unknown"));
        let status = orchestrator.get_circuit_breaker_status("sync").unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(status.last_failure_time.is_none());
    }

    #[tokio::test]
    async fn test_invalid_retry_config() {
        let orchestrator = RecoveryOrchestrator::default();
        let err = orchestrator
            .execute_with_retry("x", || async { Ok(()) }, Some(&fixed_retry(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passes_through_results() {
        let orchestrator = RecoveryOrchestrator::default();
        let mut events = orchestrator.subscribe();

        let value = orchestrator
            .execute_with_deadline("quick", || async { Ok(7) }, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = orchestrator
            .execute_with_deadline(
                "quick",
                || async { Err::<(), _>(OperationError::NotFound("row".into())) },
                Duration::from_secs(1),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Operation(OperationError::NotFound(_))));

        let event = events.try_recv().unwrap();
        assert_eq!((event.attempt, event.max_attempts), (1, 1));
        assert_eq!(event.error.cause(), Some(&OperationError::NotFound("row".into())));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_without_config_uses_orchestrator_defaults() {
        let config = RecoveryConfig {
            retry: fixed_retry(4).without_circuit_breaker(),
            ..Default::default()
        };
        let orchestrator = RecoveryOrchestrator::new(config);
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let err = orchestrator
            .execute_with_retry(
                "defaults",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(OperationError::Network("down".into()))
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RecoveryError::MaxRetriesExceeded { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert!(orchestrator.get_circuit_breaker_status("defaults").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let orchestrator = RecoveryOrchestrator::default();
        let mut events = orchestrator.subscribe();
        orchestrator.registry.circuit_breaker("a");

        orchestrator.close();
        orchestrator.close();

        assert!(orchestrator.is_closed());
        assert_eq!(orchestrator.stats().tracked_breakers, 0);
        assert!(events.recv().await.is_none());
    }
}
