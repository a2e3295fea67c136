//! Health-checked execution support.
//!
//! The monitor is a plain future polled alongside the primary operation, not
//! a spawned task, so it cannot outlive the call that created it.

use std::future::Future;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::HealthCheckConfig;
use crate::error::{RecoveryError, RecoveryResult};

/// Outcome of a health-checked execution.
///
/// The health failure is a side channel: it never replaces the primary result.
#[derive(Debug)]
pub struct HealthCheckedOutcome<T> {
    /// Result of the primary operation.
    pub result: RecoveryResult<T>,

    /// Raised if consecutive health-check failures reached the threshold
    /// while the primary was running.
    pub health_failure: Option<RecoveryError>,
}

impl<T> HealthCheckedOutcome<T> {
    /// Whether the health monitor raised a failure.
    pub fn health_check_failed(&self) -> bool {
        self.health_failure.is_some()
    }

    /// The primary result, discarding the health signal.
    pub fn into_result(self) -> RecoveryResult<T> {
        self.result
    }
}

/// Poll `check` every `config.interval` until `config.failure_threshold`
/// consecutive failures, then resolve to `HealthCheckFailed`.
///
/// A success resets the counter. Never resolves while checks keep passing.
pub(crate) async fn monitor_until_unhealthy<H, HFut>(
    operation_id: &str,
    mut check: H,
    config: &HealthCheckConfig,
) -> RecoveryError
where
    H: FnMut() -> HFut,
    HFut: Future<Output = bool>,
{
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        ticker.tick().await;

        let healthy = match config.check_timeout {
            Some(limit) => tokio::time::timeout(limit, check()).await.unwrap_or(false),
            None => check().await,
        };

        if healthy {
            if consecutive_failures > 0 {
                debug!(
                    operation_id = %operation_id,
                    previous_failures = consecutive_failures,
                    "Health check recovered"
                );
            }
            consecutive_failures = 0;
            continue;
        }

        consecutive_failures += 1;
        warn!(
            operation_id = %operation_id,
            consecutive_failures,
            threshold = config.failure_threshold,
            "Health check failed"
        );

        if consecutive_failures >= config.failure_threshold {
            return RecoveryError::HealthCheckFailed {
                operation_id: operation_id.to_string(),
                consecutive_failures,
            };
        }
    }
}
