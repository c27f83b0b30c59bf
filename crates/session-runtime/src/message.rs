//! Session, message and settlement types shared by every component.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Longest session identifier accepted by [`SessionId::new`]
pub const MAX_SESSION_ID_LENGTH: usize = 128;

// ============================================================================
// Identifiers
// ============================================================================

/// Name of an ordered sub-stream of messages that one receiver may lock
///
/// Session ids are printable ASCII, between 1 and [`MAX_SESSION_ID_LENGTH`]
/// characters. They order lexically, which the in-memory broker relies on
/// to hand out sessions deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: String) -> Result<Self, ValidationError> {
        let field = || "session_id".to_string();

        if id.is_empty() {
            return Err(ValidationError::Required { field: field() });
        }
        if id.len() > MAX_SESSION_ID_LENGTH {
            return Err(ValidationError::OutOfRange {
                field: field(),
                message: format!("longer than {} characters", MAX_SESSION_ID_LENGTH),
            });
        }
        if let Some(bad) = id.chars().find(|c| !c.is_ascii() || c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: field(),
                message: format!("unsupported character {:?}", bad),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

impl TryFrom<String> for SessionId {
    type Error = ValidationError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

/// Broker-wide message identifier; generated as a UUID unless supplied
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(ValidationError::Required {
                field: "message_id".to_string(),
            }),
            id => Ok(Self(id.to_owned())),
        }
    }
}

/// Handle for one delivery of a message. A redelivery gets a new token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Time
// ============================================================================

/// UTC instant used for lock expiries and event records
///
/// Displays as RFC 3339 with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Instant `duration` from now, saturating at the largest representable time
    pub fn after(duration: Duration) -> Self {
        let now = Utc::now();
        let expiry = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self(expiry)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Time left until this instant; zero once it has passed
    pub fn duration_until(&self) -> Duration {
        self.0
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        f.write_str(&text)
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Outbound message addressed to a session
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
    /// Caller-supplied id linking related messages across sessions
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(session_id: SessionId, body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            session_id,
            body,
            attributes: HashMap::new(),
            correlation_id: None,
        }
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_attribute(mut self, key: String, value: String) -> Self {
        self.attributes.insert(key, value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message delivered by the broker under a session lock
///
/// Received messages are never mutated by the engine. The settlement outcome
/// is tracked separately by the dispatcher.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub body: Bytes,
    pub attributes: HashMap<String, String>,
    pub correlation_id: Option<String>,
    /// 1 on first delivery, incremented by the broker on every redelivery
    pub delivery_count: u32,
    pub lock_token: LockToken,
    pub enqueued_at: Timestamp,
}

impl ReceivedMessage {
    /// True once the message has been delivered more often than `max_count`
    pub fn has_exceeded_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count > max_count
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// An exclusively locked session handed out by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: SessionId,
    pub locked_until: Timestamp,
}

impl SessionLease {
    pub fn new(session_id: SessionId, locked_until: Timestamp) -> Self {
        Self {
            session_id,
            locked_until,
        }
    }
}

// ============================================================================
// Settlement
// ============================================================================

/// Terminal settlement of a message, reported to the broker exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Processed; removed from the session
    Complete,
    /// Returned to the head of the session for redelivery
    Abandon,
    /// Moved to the dead-letter store
    DeadLetter { reason: String },
}

impl Outcome {
    /// Short name used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Complete => "Completed",
            Self::Abandon => "Abandoned",
            Self::DeadLetter { .. } => "DeadLettered",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadLetter { reason } => write!(f, "DeadLettered ({})", reason),
            other => f.write_str(other.kind()),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
