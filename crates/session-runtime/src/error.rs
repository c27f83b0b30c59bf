//! Error types for the session processing engine.

use crate::message::SessionId;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`Broker`](crate::broker::Broker) implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unreachable: {message}")]
    Unreachable { message: String },

    #[error("Lock on session '{session_id}' was lost")]
    SessionLockLost { session_id: String },

    #[error("Session '{session_id}' not found or not owned by this receiver")]
    SessionNotFound { session_id: String },

    #[error("Lock on message '{message_id}' was lost")]
    MessageLockLost { message_id: String },

    #[error("Broker operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Provider error: {code} - {message}")]
    Provider { code: String, message: String },
}

impl BrokerError {
    /// Check if the error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::SessionLockLost { .. } => false,
            Self::SessionNotFound { .. } => false,
            Self::MessageLockLost { .. } => false,
            Self::Timeout { .. } => true,
            Self::Provider { .. } => true,
        }
    }

    /// Check if the error means the receiver no longer owns the session
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self,
            Self::SessionLockLost { .. } | Self::SessionNotFound { .. }
        )
    }

    /// Build a lock-lost error for a session
    pub fn lock_lost(session_id: &SessionId) -> Self {
        Self::SessionLockLost {
            session_id: session_id.to_string(),
        }
    }
}

/// Errors returned by user-supplied message handlers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed; the dispatcher retries according to the retry policy
    #[error("Handler failed: {message}")]
    Failed { message: String },

    /// The message can never be processed; it is dead-lettered without retry
    #[error("Message rejected as unprocessable: {reason}")]
    Poison { reason: String },
}

impl HandlerError {
    /// Create a retryable failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create a non-retryable failure
    pub fn poison(reason: impl Into<String>) -> Self {
        Self::Poison {
            reason: reason.into(),
        }
    }

    /// Check if the dispatcher should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validation errors for domain identifiers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Process-level errors raised by the [`SessionProcessor`](crate::processor::SessionProcessor)
///
/// Only startup and configuration failures are fatal. Everything that happens
/// while processing is reported through the event sink instead.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed to start: {source}")]
    Startup {
        #[source]
        source: BrokerError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processor is already running")]
    AlreadyStarted,

    #[error("Processor has been stopped and cannot be restarted")]
    Stopped,
}

/// Origin of a recoverable processing error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorSource {
    /// The user handler failed or timed out
    Handler,
    /// The session lock was lost while the session was being processed
    LockLost,
    /// A broker call failed while receiving or settling messages
    Broker,
    /// Accepting a new session failed
    AcceptSession,
    /// Renewing a session lock failed
    Renewal,
}

impl std::fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handler => "Handler",
            Self::LockLost => "LockLost",
            Self::Broker => "Broker",
            Self::AcceptSession => "AcceptSession",
            Self::Renewal => "Renewal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
