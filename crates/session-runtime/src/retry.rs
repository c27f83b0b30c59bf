//! # Retry Policy Module
//!
//! Exponential backoff for handler failures.
//!
//! The delay before retry `n` (0-based) is `min(delay * 2^n, max_delay)`. No
//! jitter is applied, so successive delays never decrease.

use std::time::Duration;

/// Backoff settings applied to a single message
///
/// # Examples
///
/// ```rust
/// use session_runtime::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(
///     3,
///     Duration::from_millis(100),
///     Duration::from_millis(500),
///     Duration::from_secs(1),
/// );
///
/// assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
/// assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
/// assert_eq!(policy.calculate_delay(3), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first handler call
    pub max_retries: u32,
    /// Base delay, used before the first retry
    pub delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Limit on one handler call
    pub try_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        delay: Duration,
        max_delay: Duration,
        try_timeout: Duration,
    ) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            try_timeout,
        }
    }

    /// Delay before retry number `retry` (0-based), saturating on overflow
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let scaled = 2u32
            .checked_pow(retry)
            .and_then(|factor| self.delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        scaled.min(self.max_delay)
    }

    /// Whether retry number `retry` (0-based) is still within budget
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Handler calls made for a message that always fails
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Retry bookkeeping for one message
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    retries_used: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler calls made so far, counting the one in progress
    pub fn attempts(&self) -> u32 {
        self.retries_used + 1
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Claim the next retry
    ///
    /// Returns the delay to wait before it, or `None` once the policy's
    /// retry budget is spent.
    pub fn next_backoff(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        if !policy.should_retry(self.retries_used) {
            return None;
        }
        let delay = policy.calculate_delay(self.retries_used);
        self.retries_used += 1;
        Some(delay)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
