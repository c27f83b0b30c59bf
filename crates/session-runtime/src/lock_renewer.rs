//! Automatic session lock renewal.
//!
//! A [`LockRenewer`] starts one background task per accepted session. The task
//! renews the session lock when half of the remaining lock time has elapsed
//! and stops renewing once the configured maximum auto-renewal duration is
//! used up.
//!
//! # Lock loss
//!
//! The owning worker observes lock loss through [`SessionLockHandle`]:
//! - the broker rejects a renewal with a non-transient error
//! - transient renewal failures continue until the lock actually expires
//! - the renewal budget runs out and the lock expires
//! - the worker itself learns about the loss from another broker call
//!
//! In every case the `lock_lost` token is cancelled exactly once and the first
//! recorded cause is kept.

use crate::broker::Broker;
use crate::error::ErrorSource;
use crate::events::{EventSink, ProcessorEvent};
use crate::message::{SessionId, SessionLease, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "lock_renewer_tests.rs"]
mod tests;

/// Shortest wait between renewal attempts
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(1);

/// Starts renewal tasks for accepted sessions
#[derive(Clone)]
pub struct LockRenewer {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn EventSink>,
    max_renewal_duration: Duration,
}

impl LockRenewer {
    /// Create a renewer
    ///
    /// # Arguments
    ///
    /// * `broker` - Broker that owns the session locks
    /// * `sink` - Destination for renewal events
    /// * `max_renewal_duration` - Total time a lock is kept alive; zero disables renewal
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn EventSink>,
        max_renewal_duration: Duration,
    ) -> Self {
        Self {
            broker,
            sink,
            max_renewal_duration,
        }
    }

    /// Start keeping the lock of `lease` alive
    pub fn start(&self, lease: &SessionLease) -> SessionLockHandle {
        let shared = Arc::new(SharedLockState {
            session_id: lease.session_id.clone(),
            status: Mutex::new(LockStatus {
                locked_until: lease.locked_until,
                lost_cause: None,
            }),
            lock_lost: CancellationToken::new(),
        });
        let stop = CancellationToken::new();

        let task = RenewalTask {
            broker: Arc::clone(&self.broker),
            sink: Arc::clone(&self.sink),
            max_renewal_duration: self.max_renewal_duration,
            shared: Arc::clone(&shared),
            stop: stop.clone(),
        };

        let join = tokio::spawn(task.run());

        SessionLockHandle {
            shared,
            stop,
            join: Some(join),
        }
    }
}

#[derive(Debug)]
struct LockStatus {
    locked_until: Timestamp,
    lost_cause: Option<String>,
}

struct SharedLockState {
    session_id: SessionId,
    status: Mutex<LockStatus>,
    lock_lost: CancellationToken,
}

impl SharedLockState {
    fn status(&self) -> std::sync::MutexGuard<'_, LockStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record lock loss; only the first cause is kept
    fn mark_lost(&self, cause: String) -> bool {
        {
            let mut status = self.status();
            if status.lost_cause.is_some() {
                return false;
            }
            status.lost_cause = Some(cause);
        }
        self.lock_lost.cancel();
        true
    }
}

/// Worker-side view of a session lock kept alive by a [`LockRenewer`]
pub struct SessionLockHandle {
    shared: Arc<SharedLockState>,
    stop: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SessionLockHandle {
    /// Token cancelled when the lock is lost
    pub fn lock_lost(&self) -> &CancellationToken {
        &self.shared.lock_lost
    }

    /// Check whether the lock has been lost
    pub fn is_lost(&self) -> bool {
        self.shared.lock_lost.is_cancelled()
    }

    /// Cause of the lock loss, if the lock was lost
    pub fn lost_cause(&self) -> Option<String> {
        self.shared.status().lost_cause.clone()
    }

    /// Latest known lock expiry
    pub fn locked_until(&self) -> Timestamp {
        self.shared.status().locked_until
    }

    /// Record a lock loss discovered outside the renewal task
    ///
    /// Returns `false` if the loss had already been recorded.
    pub fn mark_lost(&self, cause: impl Into<String>) -> bool {
        self.shared.mark_lost(cause.into())
    }

    /// Stop renewing and wait for the renewal task to finish
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(
                    session_id = %self.shared.session_id,
                    error = %e,
                    "Lock renewal task ended abnormally"
                );
            }
        }
    }
}

impl Drop for SessionLockHandle {
    fn drop(&mut self) {
        // Never leave a renewal task running for a session nobody owns
        self.stop.cancel();
    }
}

struct RenewalTask {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn EventSink>,
    max_renewal_duration: Duration,
    shared: Arc<SharedLockState>,
    stop: CancellationToken,
}

impl RenewalTask {
    async fn run(self) {
        let session_id = self.shared.session_id.clone();
        let renewal_deadline = Instant::now() + self.max_renewal_duration;

        loop {
            let remaining = self.shared.status().locked_until.duration_until();
            if remaining.is_zero() {
                self.lose(format!("Session lock on '{}' expired", session_id));
                return;
            }

            let renew_at = Instant::now() + (remaining / 2).max(MIN_RENEWAL_INTERVAL);
            if renew_at > renewal_deadline {
                self.expire_after_budget(remaining).await;
                return;
            }

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = self.shared.lock_lost.cancelled() => return,
                _ = tokio::time::sleep_until(renew_at) => {}
            }

            match self.broker.renew_session_lock(&session_id).await {
                Ok(locked_until) => {
                    self.shared.status().locked_until = locked_until;
                    debug!(
                        session_id = %session_id,
                        locked_until = %locked_until,
                        "Session lock renewed"
                    );
                    self.sink
                        .emit(ProcessorEvent::LockRenewed {
                            session_id: session_id.clone(),
                            locked_until,
                        })
                        .await;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        session_id = %session_id,
                        error = %e,
                        "Transient failure renewing session lock; will retry"
                    );
                    self.sink
                        .emit(ProcessorEvent::ProcessingError {
                            source: ErrorSource::Renewal,
                            session_id: Some(session_id.clone()),
                            message_id: None,
                            cause: e.to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    self.lose(e.to_string());
                    return;
                }
            }
        }
    }

    /// Stop renewing and report loss once the current lock runs out
    async fn expire_after_budget(&self, remaining: Duration) {
        info!(
            session_id = %self.shared.session_id,
            max_renewal_ms = self.max_renewal_duration.as_millis() as u64,
            "Maximum auto lock renewal duration reached; lock will not be renewed"
        );

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {}
            _ = self.shared.lock_lost.cancelled() => {}
            _ = tokio::time::sleep(remaining) => {
                self.lose(format!(
                    "Session lock on '{}' expired after the maximum auto-renewal duration",
                    self.shared.session_id
                ));
            }
        }
    }

    fn lose(&self, cause: String) {
        if self.shared.mark_lost(cause.clone()) {
            warn!(
                session_id = %self.shared.session_id,
                cause = %cause,
                "Session lock lost"
            );
        }
    }
}
