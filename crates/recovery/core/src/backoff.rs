//! Backoff curves for retry delays.
//!
//! `Fixed` and `Linear` are uncapped; the exponential curves are capped at
//! [`MAX_BACKOFF`]. The asymmetry is kept as-is.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryStrategy;

/// Cap applied to the exponential curves.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Upper bound (exclusive) of the positive jitter fraction.
const JITTER_FRACTION: f64 = 0.1;

impl RetryStrategy {
    /// Delay to wait after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32, base_delay: Duration) -> Duration {
        let jitter = match self {
            RetryStrategy::ExponentialJittered => rand::thread_rng().gen_range(0.0..JITTER_FRACTION),
            _ => 0.0,
        };
        self.delay_with_jitter(attempt, base_delay, jitter)
    }

    /// Delay for `attempt` with an explicit jitter fraction in `[0, 0.1)`.
    ///
    /// Only `ExponentialJittered` uses the jitter value.
    pub(crate) fn delay_with_jitter(&self, attempt: u32, base_delay: Duration, jitter: f64) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = base_delay.as_secs_f64() * 1000.0;

        match self {
            RetryStrategy::Fixed => base_delay,
            RetryStrategy::Linear => base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => capped(base_ms * exponent(attempt)),
            RetryStrategy::ExponentialJittered => {
                capped(base_ms * exponent(attempt) * (1.0 + jitter))
            }
        }
    }
}

fn exponent(attempt: u32) -> f64 {
    2f64.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32)
}

fn capped(delay_ms: f64) -> Duration {
    let cap = MAX_BACKOFF.as_millis() as f64;
    Duration::from_nanos((delay_ms.min(cap) * 1_000_000.0).round() as u64)
}
