//! Error types for recovery-core.
//!
//! Two layers: [`OperationError`] is what a wrapped operation fails with, and
//! [`RecoveryError`] is what a recovery strategy surfaces to its caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchError;

/// Failure reported by a wrapped operation.
///
/// Classification works on the variant (see [`ErrorKind`]), never on the
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// Generic network failure.
    #[error("network error: {0}")]
    Network(String),

    /// Connection could not be established or was reset.
    #[error("connection error: {0}")]
    Connection(String),

    /// The operation did not complete in time.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Low-level socket failure.
    #[error("socket error: {0}")]
    Socket(String),

    /// Caller supplied bad input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Remote side is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl OperationError {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::Network(_) => ErrorKind::Network,
            OperationError::Connection(_) => ErrorKind::Connection,
            OperationError::Timeout(_) => ErrorKind::Timeout,
            OperationError::Socket(_) => ErrorKind::Socket,
            OperationError::InvalidInput(_) => ErrorKind::InvalidInput,
            OperationError::NotFound(_) => ErrorKind::NotFound,
            OperationError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            OperationError::Storage(_) => ErrorKind::Storage,
            OperationError::Unavailable(_) => ErrorKind::Unavailable,
            OperationError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the error is network-shaped (network, connection, timeout, socket).
    pub fn is_network(&self) -> bool {
        self.kind().is_network()
    }

    /// Check whether the error's kind is in `kinds`.
    pub fn matches_any(&self, kinds: &[ErrorKind]) -> bool {
        kinds.contains(&self.kind())
    }
}

/// Discriminant of [`OperationError`], used in configured kind lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Connection,
    Timeout,
    Socket,
    InvalidInput,
    NotFound,
    PermissionDenied,
    Storage,
    Unavailable,
    Other,
}

impl ErrorKind {
    /// Network-shaped kinds are retryable by default and are the ones the
    /// connectivity hook is consulted for.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Socket
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Socket => "socket",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Storage => "storage",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the recovery strategies.
///
/// All of these are terminal for the strategy that produced them. Breaker and
/// retry state are updated before one is returned.
#[derive(Debug, Clone, Error)]
pub enum RecoveryError {
    /// Classification marked the failure as not eligible for retry.
    #[error("operation {operation_id} failed with non-retryable error: {source}")]
    NonRetryable {
        operation_id: String,
        source: OperationError,
    },

    /// All attempts were used up.
    #[error("operation {operation_id} failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation_id: String,
        attempts: u32,
        source: OperationError,
    },

    /// The connectivity check vetoed further retries.
    #[error("retry of operation {operation_id} aborted after attempt {attempt}: {source}")]
    RetryAborted {
        operation_id: String,
        attempt: u32,
        source: OperationError,
    },

    /// Admission refused before any attempt was made.
    #[error("circuit breaker open for operation {operation_id}")]
    CircuitBreakerOpen { operation_id: String },

    /// The hard deadline expired.
    #[error("operation {operation_id} exceeded deadline of {}ms", .deadline.as_millis())]
    OperationTimeout {
        operation_id: String,
        deadline: Duration,
    },

    /// Primary and fallback both failed.
    #[error("operation {operation_id} failed ({primary}) and fallback failed ({fallback})")]
    FallbackFailed {
        operation_id: String,
        primary: OperationError,
        fallback: OperationError,
    },

    /// Consecutive health-check failures reached the threshold.
    #[error("health check for operation {operation_id} failed {consecutive_failures} consecutive times")]
    HealthCheckFailed {
        operation_id: String,
        consecutive_failures: u32,
    },

    /// Operation failure propagated unchanged.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// A fail-fast batch stopped at its first failure.
    #[error("batch aborted: {0}")]
    BatchAborted(Box<BatchError>),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RecoveryError {
    /// Stable label for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RecoveryError::NonRetryable { .. } => "non_retryable",
            RecoveryError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            RecoveryError::RetryAborted { .. } => "retry_aborted",
            RecoveryError::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            RecoveryError::OperationTimeout { .. } => "operation_timeout",
            RecoveryError::FallbackFailed { .. } => "fallback_failed",
            RecoveryError::HealthCheckFailed { .. } => "health_check_failed",
            RecoveryError::Operation(_) => "operation",
            RecoveryError::BatchAborted(_) => "batch_aborted",
            RecoveryError::Configuration(_) => "configuration",
        }
    }

    /// The operation error this failure wraps, if any.
    ///
    /// For [`RecoveryError::FallbackFailed`] this is the fallback's error.
    pub fn cause(&self) -> Option<&OperationError> {
        match self {
            RecoveryError::NonRetryable { source, .. }
            | RecoveryError::MaxRetriesExceeded { source, .. }
            | RecoveryError::RetryAborted { source, .. } => Some(source),
            RecoveryError::FallbackFailed { fallback, .. } => Some(fallback),
            RecoveryError::Operation(err) => Some(err),
            RecoveryError::BatchAborted(batch) => batch.error.cause(),
            _ => None,
        }
    }
}

/// Result type for recovery operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_shaped_kinds() {
        assert!(OperationError::Network("reset".into()).is_network());
        assert!(OperationError::Connection("refused".into()).is_network());
        assert!(OperationError::Timeout(Duration::from_secs(1)).is_network());
        assert!(OperationError::Socket("closed".into()).is_network());

        assert!(!OperationError::InvalidInput("bad".into()).is_network());
        assert!(!OperationError::Storage("disk full".into()).is_network());
        assert!(!OperationError::Other("boom".into()).is_network());
    }

    #[test]
    fn test_matches_any() {
        let err = OperationError::NotFound("record".into());
        assert!(err.matches_any(&[ErrorKind::Storage, ErrorKind::NotFound]));
        assert!(!err.matches_any(&[ErrorKind::Network]));
        assert!(!err.matches_any(&[]));
    }

    #[test]
    fn test_error_kind_serde_names() {
        let json = serde_json::to_string(&ErrorKind::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission_denied\"");

        let kind: ErrorKind = serde_json::from_str("\"socket\"").unwrap();
        assert_eq!(kind, ErrorKind::Socket);
    }

    #[test]
    fn test_recovery_error_cause() {
        let err = RecoveryError::MaxRetriesExceeded {
            operation_id: "sync".into(),
            attempts: 3,
            source: OperationError::Network("down".into()),
        };
        assert_eq!(err.kind_name(), "max_retries_exceeded");
        assert_eq!(err.cause(), Some(&OperationError::Network("down".into())));

        let open = RecoveryError::CircuitBreakerOpen {
            operation_id: "sync".into(),
        };
        assert!(open.cause().is_none());
        assert_eq!(
            open.to_string(),
            "circuit breaker open for operation sync"
        );
    }
}
