//! Exponential retry backoff.
//!
//! `delay(n) = min(2^n * base, max_delay)`. The cap defaults to 24 hours;
//! without it large fail counts would overflow and push retries past any
//! useful horizon. Pure arithmetic, no clock access.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default backoff base: one second.
pub const DEFAULT_BASE: Duration = Duration::from_millis(1000);

/// Default backoff ceiling: 24 hours.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff policy for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl Backoff {
    /// A policy with an explicit base and ceiling.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before the attempt following `fail_count` failures.
    pub fn delay(&self, fail_count: u32) -> Duration {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = if fail_count >= 63 {
            u64::MAX
        } else {
            1u64 << fail_count
        };
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// The delay and the resulting instant, relative to `now`.
    pub fn next_run_at(&self, fail_count: u32, now: DateTime<Utc>) -> (Duration, DateTime<Utc>) {
        let delay = self.delay(fail_count);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (delay, at)
    }
}
