//! Bounded concurrency gate.
//!
//! Counting admission primitive on top of [`tokio::sync::Semaphore`], whose
//! waiter queue is fair: admissions are granted strictly in the order they
//! started waiting.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::error::{RecoveryError, RecoveryResult};

/// Limits how many holders may be inside the gate at once.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` permits. Capacity must be positive.
    pub fn new(capacity: usize) -> RecoveryResult<Self> {
        if capacity == 0 {
            return Err(RecoveryError::Configuration(
                "concurrency gate capacity must be at least 1".to_string(),
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(RecoveryError::Configuration(format!(
                "concurrency gate capacity {} exceeds {}",
                capacity,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait for admission. The permit is released when dropped.
    pub async fn acquire(&self) -> RecoveryResult<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RecoveryError::Configuration("concurrency gate closed".to_string()))?;
        trace!(available = self.available(), "Gate admission granted");
        Ok(GatePermit { _permit: permit })
    }

    /// Admit without waiting, if a permit is free.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// Total permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }
}

/// Admission held inside a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}
