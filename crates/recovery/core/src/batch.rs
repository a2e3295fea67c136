//! Batch execution results.

use crate::error::RecoveryError;

/// Failure of one operation inside a batch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("batch operation {index} ({operation_id}) failed: {error}")]
pub struct BatchError {
    /// Position of the operation in the input.
    pub index: usize,

    /// Derived operation id the operation ran under.
    pub operation_id: String,

    /// Why it failed.
    pub error: RecoveryError,
}

/// Outcome of a batch run with `continue_on_error`.
///
/// `successes` are in completion order, not input order.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    /// Successful results, in completion order.
    pub successes: Vec<T>,

    /// Failed operations.
    pub errors: Vec<BatchError>,

    /// Number of successes.
    pub success_count: usize,

    /// Number of failures.
    pub error_count: usize,

    /// Number of operations submitted.
    pub total_count: usize,
}

impl<T> BatchResult<T> {
    pub(crate) fn with_capacity(total_count: usize) -> Self {
        Self {
            successes: Vec::with_capacity(total_count),
            errors: Vec::new(),
            success_count: 0,
            error_count: 0,
            total_count,
        }
    }

    pub(crate) fn push_success(&mut self, value: T) {
        self.successes.push(value);
        self.success_count += 1;
    }

    pub(crate) fn push_error(&mut self, error: BatchError) {
        self.errors.push(error);
        self.error_count += 1;
    }

    /// Every operation has been accounted for.
    pub fn is_complete(&self) -> bool {
        self.success_count + self.error_count == self.total_count
    }

    /// No operation failed.
    pub fn all_succeeded(&self) -> bool {
        self.error_count == 0 && self.is_complete()
    }
}
