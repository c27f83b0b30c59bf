//! The broker seam consumed by the session processing engine.
//!
//! A [`Broker`] owns storage, ordering and lock leases. The engine only drives
//! it: accept a session, pull messages in order, settle each message once,
//! keep the session lock alive and release the session when done.

use crate::error::BrokerError;
use crate::message::{Outcome, ReceivedMessage, SessionId, SessionLease, Timestamp};
use async_trait::async_trait;
use std::time::Duration;

/// Interface to a session-capable message broker
///
/// Every operation is a bounded wait. Implementations must be safe to share
/// between the processor's coordinator, workers and lock renewers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Verify that the broker can be reached
    async fn check_connection(&self) -> Result<(), BrokerError>;

    /// Accept the next available session, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when no session became available in time. A returned
    /// session is exclusively locked for the caller until `locked_until`.
    async fn accept_session(&self, timeout: Duration) -> Result<Option<SessionLease>, BrokerError>;

    /// Receive the next message of a locked session in FIFO order
    ///
    /// Returns `Ok(None)` when the session had no message within `timeout`.
    async fn pull_message(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, BrokerError>;

    /// Extend the session lock, returning the new expiry
    async fn renew_session_lock(&self, session_id: &SessionId) -> Result<Timestamp, BrokerError>;

    /// Record the terminal outcome of a received message
    async fn report_outcome(
        &self,
        session_id: &SessionId,
        message: &ReceivedMessage,
        outcome: Outcome,
    ) -> Result<(), BrokerError>;

    /// Release the session lock so another receiver may accept the session
    async fn release_session(&self, session_id: &SessionId) -> Result<(), BrokerError>;
}
