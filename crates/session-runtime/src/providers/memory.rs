//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Keeps a FIFO queue per session
//! - Hands out exclusive, expiring session locks
//! - Returns abandoned and reclaimed messages to their original position
//! - Optionally dead-letters messages that exceed a delivery count
//! - Records every settlement for inspection
//!
//! This provider is intended for:
//! - Unit and integration testing of the processing engine
//! - The command-line demo
//! - Reference behaviour for real broker adapters
//!
//! Fault injection hooks ([`InMemoryBroker::set_reachable`],
//! [`InMemoryBroker::fail_lock_renewals`], [`InMemoryBroker::expire_session_lock`])
//! make lock loss and outages reproducible.

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::message::{
    LockToken, Message, MessageId, Outcome, ReceivedMessage, SessionId, SessionLease, Timestamp,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

/// In-memory broker configuration
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// Lifetime of a session lock before it must be renewed
    pub session_lock_duration: Duration,

    /// Deliveries after which the broker dead-letters a message on receive
    pub max_delivery_count: Option<u32>,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            session_lock_duration: Duration::from_secs(30),
            max_delivery_count: None,
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Clone)]
struct StoredMessage {
    sequence: u64,
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    correlation_id: Option<String>,
    delivery_count: u32,
    enqueued_at: Timestamp,
}

impl StoredMessage {
    fn to_received(&self, session_id: &SessionId, lock_token: LockToken) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            session_id: session_id.clone(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            correlation_id: self.correlation_id.clone(),
            delivery_count: self.delivery_count,
            lock_token,
            enqueued_at: self.enqueued_at,
        }
    }
}

struct SessionLock {
    expires_at: Instant,
}

#[derive(Default)]
struct SessionQueue {
    /// Messages waiting for delivery, ordered by sequence number
    pending: VecDeque<StoredMessage>,
    /// Delivered messages awaiting settlement, keyed by lock token
    in_flight: HashMap<LockToken, StoredMessage>,
    lock: Option<SessionLock>,
}

impl SessionQueue {
    /// Put a message back at its sequence position
    fn restore(&mut self, message: StoredMessage) {
        let position = self
            .pending
            .partition_point(|m| m.sequence < message.sequence);
        self.pending.insert(position, message);
    }

    /// Drop the lock and return in-flight messages to the queue
    fn reclaim(&mut self) {
        self.lock = None;
        let in_flight: Vec<StoredMessage> = self.in_flight.drain().map(|(_, m)| m).collect();
        for message in in_flight {
            self.restore(message);
        }
    }

    /// Check the lock, reclaiming the session if it expired
    fn lock_is_live(&mut self) -> bool {
        match &self.lock {
            Some(lock) if Instant::now() < lock.expires_at => true,
            Some(_) => {
                self.reclaim();
                false
            }
            None => false,
        }
    }
}

/// Settlement recorded by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub delivery_count: u32,
    pub outcome: Outcome,
}

/// A message moved to the dead-letter store
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub body: Bytes,
    pub delivery_count: u32,
    pub reason: String,
}

struct BrokerState {
    sessions: BTreeMap<SessionId, SessionQueue>,
    next_sequence: u64,
    reachable: bool,
    failing_renewals: HashSet<SessionId>,
    settlements: Vec<SettlementRecord>,
    dead_letters: Vec<DeadLetteredMessage>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_sequence: 0,
            reachable: true,
            failing_renewals: HashSet::new(),
            settlements: Vec::new(),
            dead_letters: Vec::new(),
        }
    }

    fn ensure_reachable(&self) -> Result<(), BrokerError> {
        if self.reachable {
            Ok(())
        } else {
            Err(BrokerError::Unreachable {
                message: "in-memory broker is marked unreachable".to_string(),
            })
        }
    }

    /// Get the queue of a session whose lock is still live
    fn locked_queue(&mut self, session_id: &SessionId) -> Result<&mut SessionQueue, BrokerError> {
        let queue = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        if queue.lock_is_live() {
            Ok(queue)
        } else {
            Err(BrokerError::lock_lost(session_id))
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementation
///
/// Cloning is cheap; clones share the same storage.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
    config: InMemoryBrokerConfig,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new())),
            changed: Arc::new(Notify::new()),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the state half-updated
        // in a way later calls rely on, so poisoning is ignored.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message on its session
    pub fn send(&self, message: Message) -> MessageId {
        let message_id = message.message_id.clone();
        {
            let mut state = self.state();
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let stored = StoredMessage {
                sequence,
                message_id: message.message_id,
                body: message.body,
                attributes: message.attributes,
                correlation_id: message.correlation_id,
                delivery_count: 0,
                enqueued_at: Timestamp::now(),
            };

            state
                .sessions
                .entry(message.session_id)
                .or_default()
                .pending
                .push_back(stored);
        }

        self.changed.notify_waiters();
        message_id
    }

    /// Enqueue several messages, preserving their order
    pub fn send_batch(&self, messages: Vec<Message>) -> Vec<MessageId> {
        messages.into_iter().map(|m| self.send(m)).collect()
    }

    /// Simulate an outage (or recovery) of the broker
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
        self.changed.notify_waiters();
    }

    /// Make every future lock renewal of a session fail with lock loss
    pub fn fail_lock_renewals(&self, session_id: &SessionId) {
        self.state().failing_renewals.insert(session_id.clone());
    }

    /// Immediately expire the lock of a session, as if it had been reassigned
    pub fn expire_session_lock(&self, session_id: &SessionId) {
        if let Some(queue) = self.state().sessions.get_mut(session_id) {
            queue.reclaim();
        }
        self.changed.notify_waiters();
    }

    /// Number of messages waiting for delivery on a session
    pub fn pending_count(&self, session_id: &SessionId) -> usize {
        self.state()
            .sessions
            .get(session_id)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Number of undelivered or unsettled messages across all sessions
    pub fn unsettled_count(&self) -> usize {
        self.state()
            .sessions
            .values()
            .map(|q| q.pending.len() + q.in_flight.len())
            .sum()
    }

    /// Check whether a session currently holds a live lock
    pub fn is_session_locked(&self, session_id: &SessionId) -> bool {
        self.state()
            .sessions
            .get_mut(session_id)
            .map(|q| q.lock_is_live())
            .unwrap_or(false)
    }

    /// All settlements recorded so far, in the order they were reported
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.state().settlements.clone()
    }

    /// Settlements of a single session
    pub fn session_settlements(&self, session_id: &SessionId) -> Vec<SettlementRecord> {
        self.state()
            .settlements
            .iter()
            .filter(|s| &s.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Messages moved to the dead-letter store
    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state().dead_letters.clone()
    }

    /// Try to lock the first available session
    fn try_accept(&self, state: &mut BrokerState) -> Option<SessionLease> {
        let lock_duration = self.config.session_lock_duration;

        for (session_id, queue) in state.sessions.iter_mut() {
            if queue.lock_is_live() || queue.pending.is_empty() {
                continue;
            }

            queue.lock = Some(SessionLock {
                expires_at: Instant::now() + lock_duration,
            });
            return Some(SessionLease::new(
                session_id.clone(),
                Timestamp::after(lock_duration),
            ));
        }

        None
    }

    /// Earliest lock expiry among locked sessions that still have work
    fn next_lock_expiry(state: &BrokerState) -> Option<Instant> {
        state
            .sessions
            .values()
            .filter(|q| !q.pending.is_empty() || !q.in_flight.is_empty())
            .filter_map(|q| q.lock.as_ref().map(|l| l.expires_at))
            .min()
    }

    /// Pop the next deliverable message, dead-lettering exhausted ones
    fn try_receive(
        &self,
        state: &mut BrokerState,
        session_id: &SessionId,
    ) -> Result<Option<ReceivedMessage>, BrokerError> {
        let max_delivery_count = self.config.max_delivery_count;
        let mut exhausted = Vec::new();

        let received = {
            let queue = state.locked_queue(session_id)?;
            loop {
                let Some(mut stored) = queue.pending.pop_front() else {
                    break None;
                };
                stored.delivery_count += 1;

                if max_delivery_count.is_some_and(|max| stored.delivery_count > max) {
                    exhausted.push(stored);
                    continue;
                }

                let lock_token = LockToken::new();
                let received = stored.to_received(session_id, lock_token.clone());
                queue.in_flight.insert(lock_token, stored);
                break Some(received);
            }
        };

        for stored in exhausted {
            tracing::debug!(
                session_id = %session_id,
                message_id = %stored.message_id,
                delivery_count = stored.delivery_count,
                "Broker dead-lettered message that exceeded max delivery count"
            );
            state.dead_letters.push(DeadLetteredMessage {
                session_id: session_id.clone(),
                message_id: stored.message_id,
                body: stored.body,
                delivery_count: stored.delivery_count,
                reason: "MaxDeliveryCountExceeded".to_string(),
            });
        }

        Ok(received)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn check_connection(&self) -> Result<(), BrokerError> {
        self.state().ensure_reachable()
    }

    async fn accept_session(&self, timeout: Duration) -> Result<Option<SessionLease>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state();
                state.ensure_reachable()?;

                if let Some(lease) = self.try_accept(&mut state) {
                    return Ok(Some(lease));
                }

                match Self::next_lock_expiry(&state) {
                    Some(expiry) => expiry.min(deadline),
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Woken either by a state change or by a lock that may have expired
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn pull_message(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lock_expiry = {
                let mut state = self.state();
                state.ensure_reachable()?;

                if let Some(message) = self.try_receive(&mut state, session_id)? {
                    return Ok(Some(message));
                }

                state
                    .sessions
                    .get(session_id)
                    .and_then(|q| q.lock.as_ref().map(|l| l.expires_at))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = lock_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn renew_session_lock(&self, session_id: &SessionId) -> Result<Timestamp, BrokerError> {
        let lock_duration = self.config.session_lock_duration;
        let mut state = self.state();
        state.ensure_reachable()?;

        if state.failing_renewals.contains(session_id) {
            if let Some(queue) = state.sessions.get_mut(session_id) {
                queue.reclaim();
            }
            drop(state);
            self.changed.notify_waiters();
            return Err(BrokerError::lock_lost(session_id));
        }

        let queue = state.locked_queue(session_id)?;
        if let Some(lock) = queue.lock.as_mut() {
            lock.expires_at = Instant::now() + lock_duration;
        }

        Ok(Timestamp::after(lock_duration))
    }

    async fn report_outcome(
        &self,
        session_id: &SessionId,
        message: &ReceivedMessage,
        outcome: Outcome,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state();
            state.ensure_reachable()?;

            let queue = state.locked_queue(session_id)?;
            let stored = queue.in_flight.remove(&message.lock_token).ok_or_else(|| {
                BrokerError::MessageLockLost {
                    message_id: message.message_id.to_string(),
                }
            })?;

            let delivery_count = stored.delivery_count;
            match &outcome {
                Outcome::Complete => {}
                Outcome::Abandon => queue.restore(stored),
                Outcome::DeadLetter { reason } => {
                    let dead = DeadLetteredMessage {
                        session_id: session_id.clone(),
                        message_id: stored.message_id,
                        body: stored.body,
                        delivery_count,
                        reason: reason.clone(),
                    };
                    state.dead_letters.push(dead);
                }
            }

            state.settlements.push(SettlementRecord {
                session_id: session_id.clone(),
                message_id: message.message_id.clone(),
                delivery_count,
                outcome,
            });
        }

        self.changed.notify_waiters();
        Ok(())
    }

    async fn release_session(&self, session_id: &SessionId) -> Result<(), BrokerError> {
        let result = {
            let mut state = self.state();
            state.ensure_reachable()?;

            match state.sessions.get_mut(session_id) {
                Some(queue) => {
                    let was_live = queue.lock_is_live();
                    queue.reclaim();
                    if was_live {
                        Ok(())
                    } else {
                        Err(BrokerError::lock_lost(session_id))
                    }
                }
                None => Err(BrokerError::SessionNotFound {
                    session_id: session_id.to_string(),
                }),
            }
        };

        self.changed.notify_waiters();
        result
    }
}
