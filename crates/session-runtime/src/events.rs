//! Lifecycle and diagnostic events emitted by the processor.
//!
//! Every component receives the same `Arc<dyn EventSink>` at construction.
//! Events are delivered by awaiting [`EventSink::emit`], so a slow sink slows
//! the emitting worker down instead of growing an unbounded backlog.
//!
//! Three sinks are provided:
//! - [`TracingEventSink`] writes structured log records through `tracing`
//! - [`ChannelEventSink`] forwards events into a bounded queue
//! - [`FanoutEventSink`] forwards to several sinks in order

use crate::error::ErrorSource;
use crate::message::{MessageId, Outcome, SessionId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;

/// Why a session stopped being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The session had no further messages
    Completed,
    /// The session lock expired or was taken away
    LockLost,
    /// The processor is stopping
    Shutdown,
    /// The broker refused further work on the session
    BrokerRequested,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "Completed",
            Self::LockLost => "LockLost",
            Self::Shutdown => "Shutdown",
            Self::BrokerRequested => "BrokerRequested",
        };
        f.write_str(name)
    }
}

/// Event emitted by the session processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorEvent {
    SessionOpened {
        session_id: SessionId,
        locked_until: Timestamp,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    MessageReceived {
        session_id: SessionId,
        message_id: MessageId,
        delivery_count: u32,
    },
    MessageSettled {
        session_id: SessionId,
        message_id: MessageId,
        outcome: Outcome,
    },
    LockRenewed {
        session_id: SessionId,
        locked_until: Timestamp,
    },
    ProcessingError {
        source: ErrorSource,
        session_id: Option<SessionId>,
        message_id: Option<MessageId>,
        cause: String,
    },
}

impl ProcessorEvent {
    /// Name of the event variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "SessionOpened",
            Self::SessionClosed { .. } => "SessionClosed",
            Self::MessageReceived { .. } => "MessageReceived",
            Self::MessageSettled { .. } => "MessageSettled",
            Self::LockRenewed { .. } => "LockRenewed",
            Self::ProcessingError { .. } => "ProcessingError",
        }
    }

    /// Session the event relates to, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionOpened { session_id, .. }
            | Self::SessionClosed { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::MessageSettled { session_id, .. }
            | Self::LockRenewed { session_id, .. } => Some(session_id),
            Self::ProcessingError { session_id, .. } => session_id.as_ref(),
        }
    }

    /// Message the event relates to, if any
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::MessageReceived { message_id, .. } | Self::MessageSettled { message_id, .. } => {
                Some(message_id)
            }
            Self::ProcessingError { message_id, .. } => message_id.as_ref(),
            _ => None,
        }
    }

    /// Human readable detail for logs
    pub fn detail(&self) -> String {
        match self {
            Self::SessionOpened { locked_until, .. } => {
                format!("Session initialized and locked until {}", locked_until)
            }
            Self::SessionClosed { reason, .. } => format!("Session closing ({})", reason),
            Self::MessageReceived { delivery_count, .. } => {
                format!("Received message (delivery {})", delivery_count)
            }
            Self::MessageSettled { outcome, .. } => format!("Message settled: {}", outcome),
            Self::LockRenewed { locked_until, .. } => {
                format!("Session lock renewed until {}", locked_until)
            }
            Self::ProcessingError { source, cause, .. } => {
                format!("Received error ({}): {}", source, cause)
            }
        }
    }

    /// Flatten into the record shape written to the observability stream
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            timestamp: Timestamp::now(),
            session_id: self.session_id().map(|s| s.to_string()),
            message_id: self.message_id().map(|m| m.to_string()),
            kind: self.kind().to_string(),
            detail: self.detail(),
        }
    }
}

/// Flat, serializable form of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: Timestamp,
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub kind: String,
    pub detail: String,
}

impl EventRecord {
    /// Serialize as a single JSON line
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Destination for processor events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Implementations must not panic.
    async fn emit(&self, event: ProcessorEvent);
}

// ============================================================================
// Tracing sink
// ============================================================================

/// Sink that writes every event as a structured `tracing` record
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl TracingEventSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: ProcessorEvent) {
        let record = event.to_record();
        let session_id = record.session_id.as_deref().unwrap_or("-");
        let message_id = record.message_id.as_deref().unwrap_or("-");

        match &event {
            ProcessorEvent::ProcessingError {
                source: ErrorSource::Handler,
                ..
            } => warn!(
                session_id,
                message_id,
                event_kind = %record.kind,
                detail = %record.detail,
                "Processing error"
            ),
            ProcessorEvent::ProcessingError { .. } => error!(
                session_id,
                message_id,
                event_kind = %record.kind,
                detail = %record.detail,
                "Processing error"
            ),
            _ => info!(
                session_id,
                message_id,
                event_kind = %record.kind,
                detail = %record.detail,
                "Processor event"
            ),
        }
    }
}

// ============================================================================
// Channel sink
// ============================================================================

/// Sink that forwards events into a bounded channel
///
/// When the channel is full, `emit` waits up to `send_timeout` for capacity
/// and then drops the event with a warning.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<ProcessorEvent>,
    send_timeout: Duration,
}

impl ChannelEventSink {
    /// Create a sink and the receiver consuming its events
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<ProcessorEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                send_timeout,
            },
            receiver,
        )
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: ProcessorEvent) {
        let kind = event.kind();
        match self.sender.send_timeout(event, self.send_timeout).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    event_kind = kind,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Event sink full; dropping event"
                );
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                warn!(event_kind = kind, "Event sink receiver closed; dropping event");
            }
        }
    }
}

// ============================================================================
// Fan-out sink
// ============================================================================

/// Sink that forwards every event to each inner sink in order
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Add another sink at the end of the chain
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: ProcessorEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}
