//! Session workers.
//!
//! Each accepted session is bound to one worker slot. The worker keeps the
//! session lock alive through the [`LockRenewer`], pulls messages strictly in
//! session order and hands them one at a time to the [`MessageDispatcher`].
//!
//! A worker finishes when the session is drained, its lock is lost, the
//! broker refuses further work or the processor shuts down. The semaphore
//! permit it holds is released only after its slot has been unregistered, so
//! a session can never be bound to two slots at once.

use crate::broker::Broker;
use crate::dispatcher::{DispatchSignals, Interruption, MessageDispatcher};
use crate::error::ErrorSource;
use crate::events::{CloseReason, EventSink, ProcessorEvent};
use crate::lock_renewer::{LockRenewer, SessionLockHandle};
use crate::message::{Outcome, ReceivedMessage, SessionId, SessionLease};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Identifier of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// A session that already has a worker cannot be bound again
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Session '{session_id}' is already bound to {slot_id}")]
pub struct SessionAlreadyBound {
    pub session_id: SessionId,
    pub slot_id: SlotId,
}

/// Worker behaviour derived from the processor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How long a pull waits before the session is considered drained
    pub session_idle_timeout: Duration,
    /// Messages buffered ahead of the one being handled
    pub prefetch_count: u32,
}

/// How a worker finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub slot_id: SlotId,
    pub reason: CloseReason,
    /// Messages handed to the dispatcher
    pub messages_dispatched: u32,
}

type SlotRegistry = Arc<Mutex<HashMap<SessionId, SlotId>>>;

fn registry(slots: &SlotRegistry) -> MutexGuard<'_, HashMap<SessionId, SlotId>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-only view of the sessions bound to worker slots
#[derive(Clone, Default)]
pub struct ActiveSessions {
    slots: SlotRegistry,
}

impl ActiveSessions {
    /// Bound sessions, sorted by id
    pub fn list(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = registry(&self.slots).keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn len(&self) -> usize {
        registry(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters a slot when dropped, even if the worker panics
struct SlotRegistration {
    slots: SlotRegistry,
    session_id: SessionId,
    slot_id: SlotId,
}

impl Drop for SlotRegistration {
    fn drop(&mut self) {
        let mut slots = registry(&self.slots);
        if slots.get(&self.session_id) == Some(&self.slot_id) {
            slots.remove(&self.session_id);
        }
    }
}

/// Slot ownership held by a running worker
///
/// Field order matters: the registration is dropped before the permit.
struct SlotLease {
    registration: SlotRegistration,
    _permit: OwnedSemaphorePermit,
}

// ============================================================================
// SessionWorkerPool
// ============================================================================

/// Bounded set of session workers
pub struct SessionWorkerPool {
    broker: Arc<dyn Broker>,
    dispatcher: MessageDispatcher,
    renewer: LockRenewer,
    sink: Arc<dyn EventSink>,
    settings: WorkerSettings,
    slots: SlotRegistry,
    next_slot: u64,
    workers: JoinSet<SessionSummary>,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
}

impl SessionWorkerPool {
    /// Create an empty pool
    ///
    /// Cancelling `shutdown` makes every worker finish its current message
    /// and stop.
    pub fn new(
        broker: Arc<dyn Broker>,
        dispatcher: MessageDispatcher,
        renewer: LockRenewer,
        sink: Arc<dyn EventSink>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            renewer,
            sink,
            settings,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_slot: 0,
            workers: JoinSet::new(),
            shutdown,
            hard_stop: CancellationToken::new(),
        }
    }

    /// Bind an accepted session to a new slot and start its worker
    ///
    /// The permit is held until the worker finishes.
    pub fn spawn(
        &mut self,
        lease: SessionLease,
        permit: OwnedSemaphorePermit,
    ) -> Result<SlotId, SessionAlreadyBound> {
        let slot_id = SlotId(self.next_slot);

        {
            let mut slots = registry(&self.slots);
            if let Some(existing) = slots.get(&lease.session_id) {
                return Err(SessionAlreadyBound {
                    session_id: lease.session_id.clone(),
                    slot_id: *existing,
                });
            }
            slots.insert(lease.session_id.clone(), slot_id);
        }
        self.next_slot += 1;

        let slot = SlotLease {
            registration: SlotRegistration {
                slots: Arc::clone(&self.slots),
                session_id: lease.session_id.clone(),
                slot_id,
            },
            _permit: permit,
        };

        debug!(session_id = %lease.session_id, slot_id = %slot_id, "Starting session worker");

        let worker = SessionWorker {
            lease,
            slot_id,
            broker: Arc::clone(&self.broker),
            dispatcher: self.dispatcher.clone(),
            renewer: self.renewer.clone(),
            sink: Arc::clone(&self.sink),
            settings: self.settings,
            shutdown: self.shutdown.clone(),
            hard_stop: self.hard_stop.clone(),
        };

        self.workers.spawn(worker.run(slot));
        Ok(slot_id)
    }

    /// Number of running workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sessions currently bound to a slot
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.active_view().list()
    }

    /// Shareable view of the bound sessions
    pub fn active_view(&self) -> ActiveSessions {
        ActiveSessions {
            slots: Arc::clone(&self.slots),
        }
    }

    /// Wait for the next worker to finish
    ///
    /// Returns `None` when no workers are running. A worker that panicked is
    /// logged and skipped.
    pub async fn join_next(&mut self) -> Option<SessionSummary> {
        loop {
            match self.workers.join_next().await? {
                Ok(summary) => return Some(summary),
                Err(e) => {
                    error!(error = %e, "Session worker terminated abnormally");
                }
            }
        }
    }

    /// Wait for all workers, abandoning in-flight work after `grace`
    pub async fn drain(&mut self, grace: Duration) -> Vec<SessionSummary> {
        let deadline = Instant::now() + grace;
        let mut finished = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.join_next()).await {
                Ok(Some(summary)) => finished.push(summary),
                Ok(None) => return finished,
                Err(_) => break,
            }
        }

        warn!(
            remaining = self.workers.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace period elapsed; abandoning in-flight messages"
        );
        self.hard_stop.cancel();

        while let Some(summary) = self.join_next().await {
            finished.push(summary);
        }
        finished
    }
}

// ============================================================================
// SessionWorker
// ============================================================================

struct SessionWorker {
    lease: SessionLease,
    slot_id: SlotId,
    broker: Arc<dyn Broker>,
    dispatcher: MessageDispatcher,
    renewer: LockRenewer,
    sink: Arc<dyn EventSink>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
}

impl SessionWorker {
    async fn run(self, slot: SlotLease) -> SessionSummary {
        let session_id = self.lease.session_id.clone();

        self.sink
            .emit(ProcessorEvent::SessionOpened {
                session_id: session_id.clone(),
                locked_until: self.lease.locked_until,
            })
            .await;

        let lock = self.renewer.start(&self.lease);
        let mut buffered = VecDeque::new();
        let mut dispatched = 0;

        let reason = self.process(&lock, &mut buffered, &mut dispatched).await;

        self.abandon_buffered(&mut buffered, lock.is_lost()).await;
        let lost_cause = lock.lost_cause();
        lock.stop().await;

        match reason {
            CloseReason::LockLost => {
                let cause = lost_cause.unwrap_or_else(|| "Session lock lost".to_string());
                warn!(
                    session_id = %session_id,
                    cause = %cause,
                    "Session lock lost; stopping worker"
                );
                self.sink
                    .emit(ProcessorEvent::ProcessingError {
                        source: ErrorSource::LockLost,
                        session_id: Some(session_id.clone()),
                        message_id: None,
                        cause,
                    })
                    .await;
            }
            _ => self.release().await,
        }

        info!(
            session_id = %session_id,
            slot_id = %self.slot_id,
            reason = %reason,
            messages = dispatched,
            "Session worker finished"
        );

        self.sink
            .emit(ProcessorEvent::SessionClosed {
                session_id: session_id.clone(),
                reason,
            })
            .await;

        debug!(session_id = %slot.registration.session_id, "Releasing worker slot");
        drop(slot);

        SessionSummary {
            session_id,
            slot_id: self.slot_id,
            reason,
            messages_dispatched: dispatched,
        }
    }

    /// Pull and dispatch messages until the session closes
    async fn process(
        &self,
        lock: &SessionLockHandle,
        buffered: &mut VecDeque<ReceivedMessage>,
        dispatched: &mut u32,
    ) -> CloseReason {
        loop {
            if self.shutdown.is_cancelled() {
                return CloseReason::Shutdown;
            }
            if lock.is_lost() {
                return CloseReason::LockLost;
            }

            let message = match buffered.pop_front() {
                Some(message) => message,
                None => match self.next_message(lock).await {
                    Ok(message) => message,
                    Err(reason) => return reason,
                },
            };

            self.prefetch(lock, buffered).await;

            self.sink
                .emit(ProcessorEvent::MessageReceived {
                    session_id: message.session_id.clone(),
                    message_id: message.message_id.clone(),
                    delivery_count: message.delivery_count,
                })
                .await;

            let signals = DispatchSignals {
                lock_lost: lock.lock_lost(),
                hard_stop: &self.hard_stop,
            };
            let report = self.dispatcher.dispatch(&message, signals).await;
            *dispatched += 1;

            match report.interruption {
                Some(Interruption::LockLost { cause }) => {
                    lock.mark_lost(cause);
                    return CloseReason::LockLost;
                }
                Some(Interruption::Shutdown) => return CloseReason::Shutdown,
                // Message n is still unsettled; n+1 must not run before it
                Some(Interruption::SettlementFailed { cause }) => {
                    warn!(
                        session_id = %self.lease.session_id,
                        message_id = %message.message_id,
                        cause = %cause,
                        "Settlement failed; closing session so the broker restores order"
                    );
                    return CloseReason::BrokerRequested;
                }
                None => {}
            }

            // An abandoned message goes back ahead of anything buffered after it
            if report.outcome == Outcome::Abandon {
                self.abandon_buffered(buffered, false).await;
            }
        }
    }

    async fn next_message(&self, lock: &SessionLockHandle) -> Result<ReceivedMessage, CloseReason> {
        let session_id = &self.lease.session_id;

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CloseReason::Shutdown),
            _ = lock.lock_lost().cancelled() => Err(CloseReason::LockLost),
            result = self.broker.pull_message(session_id, self.settings.session_idle_timeout) => {
                match result {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => {
                        debug!(session_id = %session_id, "No more messages; closing session");
                        Err(CloseReason::Completed)
                    }
                    Err(e) if e.is_lock_lost() => {
                        lock.mark_lost(e.to_string());
                        Err(CloseReason::LockLost)
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to pull message");
                        self.sink
                            .emit(ProcessorEvent::ProcessingError {
                                source: ErrorSource::Broker,
                                session_id: Some(session_id.clone()),
                                message_id: None,
                                cause: e.to_string(),
                            })
                            .await;
                        Err(CloseReason::BrokerRequested)
                    }
                }
            }
        }
    }

    /// Buffer up to `prefetch_count` already-available messages
    async fn prefetch(&self, lock: &SessionLockHandle, buffered: &mut VecDeque<ReceivedMessage>) {
        let limit = self.settings.prefetch_count as usize;

        while buffered.len() < limit && !lock.is_lost() {
            match self
                .broker
                .pull_message(&self.lease.session_id, Duration::ZERO)
                .await
            {
                Ok(Some(message)) => buffered.push_back(message),
                Ok(None) => break,
                Err(e) => {
                    // The next regular pull reports the failure
                    debug!(session_id = %self.lease.session_id, error = %e, "Prefetch stopped");
                    break;
                }
            }
        }
    }

    /// Return buffered messages to the broker
    async fn abandon_buffered(&self, buffered: &mut VecDeque<ReceivedMessage>, lock_lost: bool) {
        while let Some(message) = buffered.pop_front() {
            if let Err(e) = self
                .broker
                .report_outcome(&message.session_id, &message, Outcome::Abandon)
                .await
            {
                if lock_lost || e.is_lock_lost() {
                    debug!(
                        message_id = %message.message_id,
                        error = %e,
                        "Buffered message already reclaimed"
                    );
                } else {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to abandon buffered message"
                    );
                }
            }
        }
    }

    async fn release(&self) {
        let session_id = &self.lease.session_id;

        match self.broker.release_session(session_id).await {
            Ok(()) => debug!(session_id = %session_id, "Session released"),
            Err(e) if e.is_lock_lost() => {
                debug!(
                    session_id = %session_id,
                    error = %e,
                    "Session lock already gone at release"
                );
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to release session");
                self.sink
                    .emit(ProcessorEvent::ProcessingError {
                        source: ErrorSource::Broker,
                        session_id: Some(session_id.clone()),
                        message_id: None,
                        cause: e.to_string(),
                    })
                    .await;
            }
        }
    }
}
