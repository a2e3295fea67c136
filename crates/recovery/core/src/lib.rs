//! # Recovery Core - Error Recovery for Fallible Async Operations
//!
//! This crate wraps caller-supplied async operations with recovery
//! strategies and reports every failure on an observable event stream.
//!
//! ## Overview
//!
//! - **Retry**: bounded attempts with fixed, linear, exponential or
//!   jittered exponential backoff
//! - **Circuit Breaker**: per-operation failure counting that refuses work
//!   after a threshold and re-admits it after a cool-down
//! - **Deadline**: one attempt raced against a hard time limit
//! - **Fallback**: a secondary operation tried when the primary fails
//! - **Batch**: many operations, each under its own retry policy, behind a
//!   bounded FIFO concurrency gate
//! - **Health Check**: a periodic probe that raises a side signal while the
//!   primary operation keeps running
//!
//! ## Key Components
//!
//! - [`RecoveryOrchestrator`]: the façade exposing every strategy
//! - [`CircuitBreaker`]: per-operation breaker with lazy half-open transition
//! - [`ConcurrencyGate`]: fair admission for batch execution
//! - [`EventChannel`]: lossless fan-out of [`ErrorEvent`]s
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use recovery_core::{OperationError, RecoveryConfig, RecoveryOrchestrator, RetryConfig};
//!
//! # async fn example() {
//! let orchestrator = RecoveryOrchestrator::new(RecoveryConfig::default());
//! let mut events = orchestrator.subscribe();
//!
//! let retry = RetryConfig::default()
//!     .with_max_attempts(5)
//!     .with_base_delay(Duration::from_millis(200));
//!
//! let body = orchestrator
//!     .execute_with_retry(
//!         "fetch-profile",
//!         || async { Err::<String, _>(OperationError::Connection("refused".into())) },
//!         Some(&retry),
//!     )
//!     .await;
//!
//! for event in events.drain() {
//!     println!("attempt {}/{}: {}", event.attempt, event.max_attempts, event.error);
//! }
//! # let _ = body;
//! # }
//! ```
//!
//! ## Cancellation
//!
//! Timeouts stop waiting. An operation that does not observe cancellation
//! may keep running in the background after its timeout fires.

pub mod backoff;
pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod gate;
pub mod health;
pub mod orchestrator;
pub mod registry;

// Re-export main types
pub use backoff::MAX_BACKOFF;
pub use batch::{BatchError, BatchResult};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use config::{
    BatchConfig, CircuitBreakerConfig, FallbackConfig, HealthCheckConfig, RecoveryConfig,
    RetryConfig, RetryStrategy, DEFAULT_BATCH_CONCURRENCY,
};
pub use connectivity::{AlwaysConnected, ConnectivityCheck, ConnectivityFlag};
pub use error::{ErrorKind, OperationError, RecoveryError, RecoveryResult};
pub use events::{ErrorEvent, EventChannel, EventSubscription};
pub use gate::{ConcurrencyGate, GatePermit};
pub use health::HealthCheckedOutcome;
pub use orchestrator::{RecoveryOrchestrator, TimeoutCallback};
pub use registry::{RecoveryRegistry, RecoveryStats, RetryState};
