//! Common test utilities for session-runtime integration tests
//!
//! This module provides:
//! - A recording message handler with scripted failures and delays
//! - A recording event sink
//! - Helpers for building configurations and seeding the in-memory broker

use async_trait::async_trait;
use bytes::Bytes;
use session_runtime::{
    EventSink, HandlerError, InMemoryBroker, InMemoryBrokerConfig, Message, MessageHandler,
    MessageId, ProcessorConfig, ProcessorEvent, ReceivedMessage, RetrySettings, SessionId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Fixtures
// ============================================================================

pub fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

/// Configuration with short timers suitable for tests
pub fn fast_config(max_concurrent_sessions: usize) -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent_sessions,
        session_idle_timeout_ms: 50,
        accept_poll_interval_ms: 20,
        shutdown_grace_period_ms: 2_000,
        retry: RetrySettings {
            max_retries: 3,
            delay_ms: 20,
            max_delay_ms: 80,
            try_timeout_ms: 2_000,
        },
        ..ProcessorConfig::default()
    }
}

pub fn broker_with_lock(lock_duration: Duration) -> InMemoryBroker {
    InMemoryBroker::new(InMemoryBrokerConfig {
        session_lock_duration: lock_duration,
        max_delivery_count: None,
    })
}

/// Enqueue `count` messages with bodies `<session>-1..=count`
#[allow(dead_code)]
pub fn seed(broker: &InMemoryBroker, session_id: &str, count: usize) -> Vec<MessageId> {
    (1..=count)
        .map(|n| {
            broker.send(Message::new(
                session(session_id),
                Bytes::from(format!("{}-{}", session_id, n)),
            ))
        })
        .collect()
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Recording Handler
// ============================================================================

/// One handler invocation
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct HandledCall {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub body: String,
    pub delivery_count: u32,
    pub started_at: Instant,
}

type Behaviour = Box<dyn Fn(&ReceivedMessage, u32) -> Result<(), HandlerError> + Send + Sync>;

/// Handler that records every call and tracks overlap
///
/// The behaviour closure receives the message and the number of previous
/// calls for the same message id.
pub struct RecordingHandler {
    calls: Mutex<Vec<HandledCall>>,
    in_handling: Mutex<HashSet<SessionId>>,
    overlaps: Mutex<Vec<SessionId>>,
    active_sessions_peak: Mutex<usize>,
    attempts: Mutex<HashMap<MessageId, u32>>,
    delay: Mutex<HashMap<String, Duration>>,
    default_delay: Duration,
    behaviour: Behaviour,
}

#[allow(dead_code)]
impl RecordingHandler {
    /// Handler that succeeds on every call
    pub fn succeeding() -> Self {
        Self::with_behaviour(Duration::ZERO, |_, _| Ok(()))
    }

    /// Handler that fails on every call
    pub fn always_failing() -> Self {
        Self::with_behaviour(Duration::ZERO, |_, _| Err(HandlerError::failed("always fails")))
    }

    pub fn with_behaviour<F>(default_delay: Duration, behaviour: F) -> Self
    where
        F: Fn(&ReceivedMessage, u32) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            in_handling: Mutex::new(HashSet::new()),
            overlaps: Mutex::new(Vec::new()),
            active_sessions_peak: Mutex::new(0),
            attempts: Mutex::new(HashMap::new()),
            delay: Mutex::new(HashMap::new()),
            default_delay,
            behaviour: Box::new(behaviour),
        }
    }

    /// Make calls for the message with this body take `delay`
    pub fn set_delay_for(&self, body: &str, delay: Duration) {
        self.delay.lock().unwrap().insert(body.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<HandledCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Bodies handled for one session, in call order
    pub fn bodies_for(&self, session_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.session_id.as_str() == session_id)
            .map(|c| c.body.clone())
            .collect()
    }

    /// Sessions that had two messages in handling at the same time
    pub fn overlaps(&self) -> Vec<SessionId> {
        self.overlaps.lock().unwrap().clone()
    }

    /// Largest number of sessions handled at the same time
    pub fn active_sessions_peak(&self) -> usize {
        *self.active_sessions_peak.lock().unwrap()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
        let body = message.body_as_str().unwrap_or_default().to_string();

        {
            let mut in_handling = self.in_handling.lock().unwrap();
            if !in_handling.insert(message.session_id.clone()) {
                self.overlaps.lock().unwrap().push(message.session_id.clone());
            }
            let mut peak = self.active_sessions_peak.lock().unwrap();
            *peak = (*peak).max(in_handling.len());
        }

        let previous = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(message.message_id.clone()).or_insert(0);
            let previous = *entry;
            *entry += 1;
            previous
        };

        self.calls.lock().unwrap().push(HandledCall {
            session_id: message.session_id.clone(),
            message_id: message.message_id.clone(),
            body: body.clone(),
            delivery_count: message.delivery_count,
            started_at: Instant::now(),
        });

        let delay = self
            .delay
            .lock()
            .unwrap()
            .get(&body)
            .copied()
            .unwrap_or(self.default_delay);

        // Leave the in-handling set even if this future is dropped mid-sleep
        let _guard = HandlingGuard {
            in_handling: &self.in_handling,
            session_id: message.session_id.clone(),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        (self.behaviour)(message, previous)
    }
}

struct HandlingGuard<'a> {
    in_handling: &'a Mutex<HashSet<SessionId>>,
    session_id: SessionId,
}

impl Drop for HandlingGuard<'_> {
    fn drop(&mut self) {
        self.in_handling.lock().unwrap().remove(&self.session_id);
    }
}

// ============================================================================
// Recording Sink
// ============================================================================

/// Event sink keeping every event in memory
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProcessorEvent>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProcessorEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events of one session, in emission order
    pub fn events_for(&self, session_id: &str) -> Vec<ProcessorEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.session_id().map(|s| s.as_str()) == Some(session_id))
            .collect()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ProcessorEvent) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ProcessorEvent) {
        self.events.lock().unwrap().push(event);
    }
}
