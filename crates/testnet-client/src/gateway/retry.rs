//! Constant-interval retry policies.

use std::time::Duration;

/// Fixed pacing between attempts, bounded by a total time budget.
///
/// An attempt is always made at time zero. After a transient failure the
/// next attempt is made one `interval` later, as long as it would still
/// start within `budget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: Duration,
}

impl RetryPolicy {
    pub const fn constant(interval: Duration, budget: Duration) -> Self {
        Self { interval, budget }
    }

    /// Used once per test run, for the first call to an engine that may
    /// still be booting.
    pub const fn registration() -> Self {
        Self::constant(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Used for every other call.
    pub const fn regular_operation() -> Self {
        Self::constant(Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Total number of attempts this policy allows, including the first.
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let retries = self.budget.as_nanos() / self.interval.as_nanos();
        u32::try_from(retries).unwrap_or(u32::MAX - 1) + 1
    }

    /// Whether another attempt may start after `attempts` have been made
    /// and `elapsed` time has passed since the first one.
    pub fn allows_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts < self.max_attempts() && elapsed + self.interval <= self.budget
    }
}
