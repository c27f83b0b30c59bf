//! Processor configuration and validation.
//!
//! All durations are stored as unsigned milliseconds so that configuration
//! files cannot express negative values. Accessors return
//! [`std::time::Duration`] for use by the engine.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on locally buffered messages per session
pub const MAX_PREFETCH_COUNT: u32 = 1000;

/// Upper bound on handler retries for a single delivery
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Configuration for a [`SessionProcessor`](crate::processor::SessionProcessor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum number of sessions processed concurrently
    pub max_concurrent_sessions: usize,

    /// Concurrent handler calls within one session. Only `1` is accepted.
    pub max_concurrent_calls_per_session: usize,

    /// Messages a worker may buffer ahead of the one being handled
    pub prefetch_count: u32,

    /// Total time a session lock is kept alive by automatic renewal
    pub max_auto_lock_renewal_duration_ms: u64,

    /// How long a worker waits for the next message before closing the session
    pub session_idle_timeout_ms: u64,

    /// Bounded wait used when asking the broker for a new session
    pub accept_poll_interval_ms: u64,

    /// Time in-flight messages get to finish after a stop is requested
    pub shutdown_grace_period_ms: u64,

    /// Deliveries after which a message is dead-lettered instead of handled
    pub max_delivery_count: u32,

    /// Maximum time an event emission may wait for sink capacity
    pub event_sink_timeout_ms: u64,

    /// Handler retry settings
    pub retry: RetrySettings,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1,
            max_concurrent_calls_per_session: 1,
            prefetch_count: 0,
            max_auto_lock_renewal_duration_ms: 14_400_000, // 4 hours
            session_idle_timeout_ms: 1_000,
            accept_poll_interval_ms: 1_000,
            shutdown_grace_period_ms: 30_000,
            max_delivery_count: 10,
            event_sink_timeout_ms: 5_000,
            retry: RetrySettings::default(),
        }
    }
}

impl ProcessorConfig {
    /// Validate configuration
    ///
    /// Rejects:
    /// - zero concurrent sessions
    /// - more than one concurrent call per session
    /// - prefetch counts above [`MAX_PREFETCH_COUNT`]
    /// - zero idle timeout, poll interval or sink timeout
    /// - zero max delivery count
    /// - invalid retry settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_sessions",
                "must be at least 1",
            ));
        }

        if self.max_concurrent_calls_per_session != 1 {
            return Err(ConfigError::invalid(
                "max_concurrent_calls_per_session",
                format!(
                    "must be 1 to preserve in-session ordering, got {}",
                    self.max_concurrent_calls_per_session
                ),
            ));
        }

        if self.prefetch_count > MAX_PREFETCH_COUNT {
            return Err(ConfigError::invalid(
                "prefetch_count",
                format!("must not exceed {}", MAX_PREFETCH_COUNT),
            ));
        }

        if self.session_idle_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "session_idle_timeout_ms",
                "must be greater than zero",
            ));
        }

        if self.accept_poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "accept_poll_interval_ms",
                "must be greater than zero",
            ));
        }

        if self.max_delivery_count == 0 {
            return Err(ConfigError::invalid(
                "max_delivery_count",
                "must be at least 1",
            ));
        }

        if self.event_sink_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "event_sink_timeout_ms",
                "must be greater than zero",
            ));
        }

        self.retry.validate()
    }

    pub fn max_auto_lock_renewal_duration(&self) -> Duration {
        Duration::from_millis(self.max_auto_lock_renewal_duration_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn event_sink_timeout(&self) -> Duration {
        Duration::from_millis(self.event_sink_timeout_ms)
    }

    /// Build the handler retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }
}

/// Retry settings as they appear in configuration files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub delay_ms: u64,

    /// Cap on the delay between retries
    pub max_delay_ms: u64,

    /// Timeout for a single handler attempt
    pub try_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 100,
            max_delay_ms: 500,
            try_timeout_ms: 1_000,
        }
    }
}

impl RetrySettings {
    /// Validate retry settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid(
                "retry.max_retries",
                format!("must not exceed {}", MAX_RETRIES_LIMIT),
            ));
        }

        if self.delay_ms == 0 {
            return Err(ConfigError::invalid(
                "retry.delay_ms",
                "must be greater than zero",
            ));
        }

        if self.max_delay_ms < self.delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!(
                    "must be at least retry.delay_ms ({} < {})",
                    self.max_delay_ms, self.delay_ms
                ),
            ));
        }

        if self.try_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "retry.try_timeout_ms",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Convert to a [`RetryPolicy`]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.try_timeout_ms),
        )
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
