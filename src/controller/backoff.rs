//! # Backoff
//!
//! Retry delays used by the reconciler and the reconcile queue.
//!
//! - [`FibonacciBackoff`]: slow progressive backoff for degraded resources,
//!   whose referenced secret is missing or malformed and may stay that way
//!   for a while.
//! - [`exponential_backoff`]: per-key delay for transient failures.
//!
//! ## Usage
//!
//! ```rust
//! use pod_refresher_controller::controller::backoff::FibonacciBackoff;
//!
//! let mut backoff = FibonacciBackoff::new(30, 600); // 30s min, 10 minutes max
//! assert_eq!(backoff.next_backoff_seconds(), 30);
//! assert_eq!(backoff.next_backoff_seconds(), 30);
//! assert_eq!(backoff.next_backoff_seconds(), 60);
//! assert_eq!(backoff.next_backoff_seconds(), 90);
//! assert_eq!(backoff.next_backoff_seconds(), 150);
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, starting from `min_secs`
/// twice and capped at `max_secs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_secs: u64,
    /// Previous backoff value in seconds
    prev_secs: u64,
    /// Current backoff value in seconds
    current_secs: u64,
    /// Maximum backoff value in seconds
    max_secs: u64,
    /// Number of backoffs handed out since the last reset
    attempts: u32,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs.min(max_secs.max(1)),
            max_secs: max_secs.max(1),
            attempts: 0,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_secs;
        let next = self.prev_secs.saturating_add(self.current_secs);
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        self.attempts = self.attempts.saturating_add(1);
        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Backoffs handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs.min(self.max_secs);
        self.attempts = 0;
    }
}

/// Exponential backoff: `base * 2^failures`, capped at `max`
#[must_use]
pub fn exponential_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(30, 600);

        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 30);
        assert_eq!(backoff.next_backoff_seconds(), 60);
        assert_eq!(backoff.next_backoff_seconds(), 90);
        assert_eq!(backoff.next_backoff_seconds(), 150);
        assert_eq!(backoff.next_backoff_seconds(), 240);
        assert_eq!(backoff.next_backoff_seconds(), 390);
        // 630 would exceed the cap
        assert_eq!(backoff.next_backoff_seconds(), 600);
        assert_eq!(backoff.next_backoff_seconds(), 600);
        assert_eq!(backoff.attempts(), 9);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(1, 10);

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));

        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 1);
    }

    #[test]
    fn test_fibonacci_min_above_max_is_capped() {
        let mut backoff = FibonacciBackoff::new(120, 60);
        assert_eq!(backoff.next_backoff_seconds(), 60);
        assert_eq!(backoff.next_backoff_seconds(), 60);
    }

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(30);
        assert_eq!(exponential_backoff(0, base, max), Duration::from_secs(1));
        assert_eq!(exponential_backoff(1, base, max), Duration::from_secs(2));
        assert_eq!(exponential_backoff(4, base, max), Duration::from_secs(16));
        assert_eq!(exponential_backoff(5, base, max), max);
        assert_eq!(exponential_backoff(64, base, max), max);
    }
}
