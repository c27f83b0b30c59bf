//! Message dispatch, retry and settlement.
//!
//! The [`MessageDispatcher`] hands one received message to the user handler,
//! retries failures with exponential backoff and settles the message with the
//! broker exactly once.
//!
//! # Message lifecycle
//!
//! ```text
//! Received → (Handling ⇄ RetryWait)* → { Completed | Abandoned | DeadLettered }
//! ```
//!
//! [`DeliveryTracker`] enforces the transitions. Once a terminal state is
//! recorded the message can neither re-enter `Handling` nor be settled again,
//! which also covers a handler finishing at the same moment the session lock
//! is lost.

use crate::broker::Broker;
use crate::error::{BrokerError, ErrorSource, HandlerError};
use crate::events::{EventSink, ProcessorEvent};
use crate::message::{Outcome, ReceivedMessage};
use crate::retry::{RetryPolicy, RetryState};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

/// Dead-letter reason used when the delivery count limit is exceeded
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

// ============================================================================
// Handler
// ============================================================================

/// User-supplied message handler
///
/// Handlers must tolerate redelivery: a message abandoned after a failure, a
/// timeout or a lock loss is delivered again later.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure
///
/// ```rust
/// use session_runtime::dispatcher::handler_fn;
///
/// let handler = handler_fn(|message| async move {
///     println!("received {}", message.message_id);
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &ReceivedMessage) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

// ============================================================================
// Delivery state machine
// ============================================================================

/// Processing state of a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Handling { attempt: u32 },
    RetryWait { attempt: u32 },
    Completed,
    Abandoned,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned | Self::DeadLettered)
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid delivery transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: DeliveryState,
    pub to: DeliveryState,
}

/// Tracks the lifecycle of one delivery and guards its single settlement
#[derive(Debug)]
pub struct DeliveryTracker {
    state: DeliveryState,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            state: DeliveryState::Received,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Enter `Handling` for the given attempt (1-based)
    pub fn begin_attempt(&mut self, attempt: u32) -> Result<(), InvalidTransition> {
        match self.state {
            DeliveryState::Received | DeliveryState::RetryWait { .. } => {
                self.state = DeliveryState::Handling { attempt };
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                to: DeliveryState::Handling { attempt },
            }),
        }
    }

    /// Enter `RetryWait` after a failed attempt
    pub fn begin_retry_wait(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            DeliveryState::Handling { attempt } => {
                self.state = DeliveryState::RetryWait { attempt };
                Ok(())
            }
            from => Err(InvalidTransition {
                from,
                to: DeliveryState::RetryWait { attempt: 0 },
            }),
        }
    }

    /// Record the terminal outcome; fails if one was already recorded
    pub fn finalize(&mut self, outcome: &Outcome) -> Result<(), InvalidTransition> {
        let to = match outcome {
            Outcome::Complete => DeliveryState::Completed,
            Outcome::Abandon => DeliveryState::Abandoned,
            Outcome::DeadLetter { .. } => DeliveryState::DeadLettered,
        };

        if self.state.is_terminal() {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }

        self.state = to;
        Ok(())
    }
}

// ============================================================================
// Dispatch results
// ============================================================================

/// Why dispatch stopped before the handler produced a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// The session lock was lost; the cause describes how
    LockLost { cause: String },
    /// The processor's shutdown grace period ran out
    Shutdown,
    /// The broker did not accept the settlement; the message is still
    /// locked and unsettled
    SettlementFailed { cause: String },
}

/// Result of dispatching one message
///
/// `outcome` is the settlement that took effect. A settlement the broker
/// rejected because the lock was lost is reported as `Abandon`, as is one
/// the broker failed to record: that message returns to the session once
/// the session is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Terminal outcome recorded for the message
    pub outcome: Outcome,
    /// Number of handler invocations started
    pub attempts: u32,
    /// Set when the session must stop being processed
    pub interruption: Option<Interruption>,
}

/// Signals that can cut dispatch short
#[derive(Debug, Clone, Copy)]
pub struct DispatchSignals<'a> {
    /// Cancelled when the session lock is lost
    pub lock_lost: &'a CancellationToken,
    /// Cancelled when in-flight work must be abandoned immediately
    pub hard_stop: &'a CancellationToken,
}

enum AttemptResult {
    Finished(Result<(), HandlerError>),
    Interrupted(Interruption),
}

// ============================================================================
// MessageDispatcher
// ============================================================================

/// Routes received messages to the handler and settles them
#[derive(Clone)]
pub struct MessageDispatcher {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    retry_policy: RetryPolicy,
    max_delivery_count: u32,
    sink: Arc<dyn EventSink>,
}

impl MessageDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        retry_policy: RetryPolicy,
        max_delivery_count: u32,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            broker,
            handler,
            retry_policy,
            max_delivery_count,
            sink,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Dispatch a message and settle it exactly once
    ///
    /// The handler runs at most `max_retries + 1` times. Each attempt is
    /// bounded by the policy's `try_timeout`; a timeout counts as a failure.
    /// A message that keeps failing is abandoned so the broker can redeliver
    /// it, and a message past `max_delivery_count` is dead-lettered.
    pub async fn dispatch(
        &self,
        message: &ReceivedMessage,
        signals: DispatchSignals<'_>,
    ) -> DispatchReport {
        let mut tracker = DeliveryTracker::new();

        if message.has_exceeded_max_delivery_count(self.max_delivery_count) {
            let outcome = Outcome::DeadLetter {
                reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
            };
            return self.settle(&mut tracker, message, outcome, 0, None).await;
        }

        let mut retry_state = RetryState::new();
        let mut attempts = 0;

        loop {
            if let Some(interruption) = Self::pending_interruption(message, signals) {
                return self
                    .settle(&mut tracker, message, Outcome::Abandon, attempts, Some(interruption))
                    .await;
            }

            attempts += 1;
            if let Err(e) = tracker.begin_attempt(attempts) {
                warn!(message_id = %message.message_id, error = %e, "Delivery state violation");
                break;
            }

            let failure = match self.run_attempt(message, signals).await {
                AttemptResult::Finished(Ok(())) => {
                    return self
                        .settle(&mut tracker, message, Outcome::Complete, attempts, None)
                        .await;
                }
                AttemptResult::Finished(Err(e)) => e,
                AttemptResult::Interrupted(interruption) => {
                    let interruption = Some(interruption);
                    return self
                        .settle(&mut tracker, message, Outcome::Abandon, attempts, interruption)
                        .await;
                }
            };

            self.report_handler_failure(message, attempts, &failure).await;

            if let HandlerError::Poison { reason } = failure {
                let outcome = Outcome::DeadLetter { reason };
                return self.settle(&mut tracker, message, outcome, attempts, None).await;
            }

            let Some(delay) = retry_state.next_backoff(&self.retry_policy) else {
                debug!(
                    message_id = %message.message_id,
                    attempts,
                    "Retries exhausted; abandoning message"
                );
                break;
            };
            if let Err(e) = tracker.begin_retry_wait() {
                warn!(message_id = %message.message_id, error = %e, "Delivery state violation");
                break;
            }

            debug!(
                message_id = %message.message_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retrying message"
            );

            tokio::select! {
                biased;
                _ = signals.lock_lost.cancelled() => {}
                _ = signals.hard_stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.settle(&mut tracker, message, Outcome::Abandon, attempts, None)
            .await
    }

    fn pending_interruption(
        message: &ReceivedMessage,
        signals: DispatchSignals<'_>,
    ) -> Option<Interruption> {
        if signals.lock_lost.is_cancelled() {
            return Some(Interruption::LockLost {
                cause: format!("Session lock lost before handling '{}'", message.message_id),
            });
        }
        if signals.hard_stop.is_cancelled() {
            return Some(Interruption::Shutdown);
        }
        None
    }

    async fn run_attempt(
        &self,
        message: &ReceivedMessage,
        signals: DispatchSignals<'_>,
    ) -> AttemptResult {
        let try_timeout = self.retry_policy.try_timeout;

        tokio::select! {
            biased;
            _ = signals.lock_lost.cancelled() => AttemptResult::Interrupted(Interruption::LockLost {
                cause: format!("Session lock lost while handling '{}'", message.message_id),
            }),
            _ = signals.hard_stop.cancelled() => AttemptResult::Interrupted(Interruption::Shutdown),
            result = tokio::time::timeout(try_timeout, self.handler.handle(message)) => {
                match result {
                    Ok(handled) => AttemptResult::Finished(handled),
                    Err(_) => AttemptResult::Finished(Err(HandlerError::failed(format!(
                        "Handler timed out after {:?}",
                        try_timeout
                    )))),
                }
            }
        }
    }

    async fn report_handler_failure(
        &self,
        message: &ReceivedMessage,
        attempt: u32,
        failure: &HandlerError,
    ) {
        warn!(
            session_id = %message.session_id,
            message_id = %message.message_id,
            attempt,
            error = %failure,
            "Message handler failed"
        );

        self.sink
            .emit(ProcessorEvent::ProcessingError {
                source: ErrorSource::Handler,
                session_id: Some(message.session_id.clone()),
                message_id: Some(message.message_id.clone()),
                cause: failure.to_string(),
            })
            .await;
    }

    /// Record the terminal outcome and report it to the broker once
    ///
    /// After a lock loss the broker call is best-effort and its failure is
    /// swallowed; the broker already returned the message, so the settled
    /// outcome is `Abandon`. A settlement that fails because the lock was lost
    /// turns into a lock-loss interruption so the worker stops the session.
    async fn settle(
        &self,
        tracker: &mut DeliveryTracker,
        message: &ReceivedMessage,
        outcome: Outcome,
        attempts: u32,
        interruption: Option<Interruption>,
    ) -> DispatchReport {
        if let Err(e) = tracker.finalize(&outcome) {
            warn!(message_id = %message.message_id, error = %e, "Message already settled");
            return DispatchReport {
                outcome,
                attempts,
                interruption,
            };
        }

        let lock_already_lost = matches!(interruption, Some(Interruption::LockLost { .. }));
        let mut interruption = interruption;
        let mut effective = outcome.clone();

        let settled = match self
            .broker
            .report_outcome(&message.session_id, message, outcome.clone())
            .await
        {
            Ok(()) => true,
            Err(e) if lock_already_lost => {
                debug!(
                    message_id = %message.message_id,
                    error = %e,
                    "Ignoring settlement failure after session lock loss"
                );
                true
            }
            Err(e) if e.is_lock_lost() || matches!(e, BrokerError::MessageLockLost { .. }) => {
                // The broker reclaimed the message; it will be redelivered
                effective = Outcome::Abandon;
                interruption = Some(Interruption::LockLost {
                    cause: e.to_string(),
                });
                true
            }
            Err(e) => {
                warn!(
                    session_id = %message.session_id,
                    message_id = %message.message_id,
                    outcome = %outcome,
                    error = %e,
                    "Failed to report message outcome"
                );
                self.sink
                    .emit(ProcessorEvent::ProcessingError {
                        source: ErrorSource::Broker,
                        session_id: Some(message.session_id.clone()),
                        message_id: Some(message.message_id.clone()),
                        cause: e.to_string(),
                    })
                    .await;
                effective = Outcome::Abandon;
                interruption = Some(Interruption::SettlementFailed {
                    cause: e.to_string(),
                });
                false
            }
        };

        if settled {
            self.sink
                .emit(ProcessorEvent::MessageSettled {
                    session_id: message.session_id.clone(),
                    message_id: message.message_id.clone(),
                    outcome: effective.clone(),
                })
                .await;
        }

        DispatchReport {
            outcome: effective,
            attempts,
            interruption,
        }
    }
}
