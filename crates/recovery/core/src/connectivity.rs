//! Environmental retry-abort hook.
//!
//! Before a retry of a network-shaped failure proceeds, the orchestrator asks
//! a [`ConnectivityCheck`] whether retrying still makes sense. Reporting no
//! connectivity aborts the retry sequence instead of burning attempts.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::error::OperationError;

/// Decides whether a retry sequence should continue.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    /// Return `false` to abort retrying `operation_id` after `error`.
    async fn should_retry(&self, operation_id: &str, error: &OperationError) -> bool;
}

/// Check that never vetoes.
pub struct AlwaysConnected;

#[async_trait]
impl ConnectivityCheck for AlwaysConnected {
    async fn should_retry(&self, _operation_id: &str, _error: &OperationError) -> bool {
        true
    }
}

/// Check backed by a flag that can be flipped at runtime, for example from a
/// network-reachability watcher.
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl ConnectivityFlag {
    /// Create a flag with the given initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Update the connectivity state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConnectivityCheck for ConnectivityFlag {
    async fn should_retry(&self, operation_id: &str, error: &OperationError) -> bool {
        let online = self.is_online();
        if !online {
            debug!(operation_id = %operation_id, error = %error, "Connectivity lost, vetoing retry");
        }
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flag_toggles() {
        let flag = ConnectivityFlag::default();
        let err = OperationError::Socket("reset".into());

        assert!(flag.should_retry("sync", &err).await);
        flag.set_online(false);
        assert!(!flag.should_retry("sync", &err).await);
        flag.set_online(true);
        assert!(flag.should_retry("sync", &err).await);
    }

    #[tokio::test]
    async fn test_always_connected() {
        let err = OperationError::Network("down".into());
        assert!(AlwaysConnected.should_retry("sync", &err).await);
    }
}
