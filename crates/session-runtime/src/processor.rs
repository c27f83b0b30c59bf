//! Top-level session processor.
//!
//! The [`SessionProcessor`] owns the coordinating loop: it acquires a permit
//! from a semaphore sized to `max_concurrent_sessions`, asks the broker for
//! the next available session and hands the accepted session to the
//! [`SessionWorkerPool`]. The permit travels with the worker and is returned
//! when the worker finishes.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──▶ Running ──stop()──▶ Stopping ──drained──▶ Stopped
//!   └─────────────────────stop()─────────────────────────────▶ Stopped
//! ```
//!
//! `start` fails with [`ProcessorError::Startup`] if the broker cannot be
//! reached, leaving the processor idle. `stop` is idempotent.

use crate::broker::Broker;
use crate::config::ProcessorConfig;
use crate::dispatcher::{MessageDispatcher, MessageHandler};
use crate::error::{ErrorSource, ProcessorError};
use crate::events::{EventSink, ProcessorEvent};
use crate::lock_renewer::LockRenewer;
use crate::message::SessionId;
use crate::worker::{ActiveSessions, SessionSummary, SessionWorkerPool, WorkerSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

enum Lifecycle {
    Idle,
    Running {
        shutdown: CancellationToken,
        coordinator: JoinHandle<()>,
        active: ActiveSessions,
    },
    /// Shutdown requested; workers are draining
    Stopping { active: ActiveSessions },
    Stopped,
}

/// Processes messages from session-enabled queues
///
/// ```rust,no_run
/// use session_runtime::{
///     handler_fn, InMemoryBroker, ProcessorConfig, SessionProcessor, TracingEventSink,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let processor = SessionProcessor::new(
///     Arc::new(InMemoryBroker::default()),
///     Arc::new(handler_fn(|message| async move {
///         println!("{}: {:?}", message.session_id, message.body_as_str());
///         Ok(())
///     })),
///     ProcessorConfig::default(),
///     Arc::new(TracingEventSink::new()),
/// )?;
///
/// processor.run_until(tokio::signal::ctrl_c()).await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionProcessor {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    config: ProcessorConfig,
    sink: Arc<dyn EventSink>,
    state: Mutex<Lifecycle>,
}

impl SessionProcessor {
    /// Create a processor after validating `config`
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        config: ProcessorConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ProcessorError> {
        config.validate()?;

        Ok(Self {
            broker,
            handler,
            config,
            sink,
            state: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Verify the broker and start accepting sessions
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut state = self.state.lock().await;
        match *state {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(ProcessorError::AlreadyStarted),
            Lifecycle::Stopping { .. } | Lifecycle::Stopped => return Err(ProcessorError::Stopped),
        }

        if let Err(source) = self.broker.check_connection().await {
            error!(error = %source, "Broker unreachable; processor not started");
            return Err(ProcessorError::Startup { source });
        }

        let shutdown = CancellationToken::new();
        let coordinator = self.coordinator(shutdown.clone());
        let active = coordinator.pool.active_view();
        let coordinator = tokio::spawn(coordinator.run());

        info!(
            max_concurrent_sessions = self.config.max_concurrent_sessions,
            prefetch_count = self.config.prefetch_count,
            max_retries = self.config.retry.max_retries,
            "Session processor started"
        );

        *state = Lifecycle::Running {
            shutdown,
            coordinator,
            active,
        };
        Ok(())
    }

    /// Stop accepting sessions and wait for workers to finish
    ///
    /// Workers finish their current message and release their sessions.
    /// Messages still in flight after the shutdown grace period are
    /// abandoned. Calling `stop` again, or before `start`, does nothing;
    /// a call made while another stop is draining returns at once.
    pub async fn stop(&self) {
        let (shutdown, coordinator) = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, Lifecycle::Stopped) {
                Lifecycle::Running {
                    shutdown,
                    coordinator,
                    active,
                } => {
                    *state = Lifecycle::Stopping { active };
                    (shutdown, coordinator)
                }
                Lifecycle::Stopping { active } => {
                    *state = Lifecycle::Stopping { active };
                    debug!("Stop already in progress");
                    return;
                }
                _ => {
                    debug!("Stop requested on a processor that is not running");
                    return;
                }
            }
        };

        info!("Stopping session processor");
        shutdown.cancel();

        // The lifecycle lock is not held here so introspection stays responsive
        if let Err(e) = coordinator.await {
            error!(error = %e, "Session coordinator terminated abnormally");
        }

        *self.state.lock().await = Lifecycle::Stopped;
        info!("Session processor stopped");
    }

    /// Run until `signal` resolves, then stop
    pub async fn run_until<F>(&self, signal: F) -> Result<(), ProcessorError>
    where
        F: Future,
    {
        self.start().await?;
        signal.await;
        self.stop().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, Lifecycle::Running { .. })
    }

    /// Sessions currently bound to a worker
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        match &*self.state.lock().await {
            Lifecycle::Running { active, .. } | Lifecycle::Stopping { active } => active.list(),
            Lifecycle::Idle | Lifecycle::Stopped => Vec::new(),
        }
    }

    fn coordinator(&self, shutdown: CancellationToken) -> Coordinator {
        let retry_policy = self.config.retry_policy();
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.handler),
            retry_policy,
            self.config.max_delivery_count,
            Arc::clone(&self.sink),
        );
        let renewer = LockRenewer::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.sink),
            self.config.max_auto_lock_renewal_duration(),
        );
        let settings = WorkerSettings {
            session_idle_timeout: self.config.session_idle_timeout(),
            prefetch_count: self.config.prefetch_count,
        };

        let pool = SessionWorkerPool::new(
            Arc::clone(&self.broker),
            dispatcher,
            renewer,
            Arc::clone(&self.sink),
            settings,
            shutdown.clone(),
        );

        Coordinator {
            broker: Arc::clone(&self.broker),
            sink: Arc::clone(&self.sink),
            pool,
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_sessions)),
            shutdown,
            accept_poll_interval: self.config.accept_poll_interval(),
            shutdown_grace_period: self.config.shutdown_grace_period(),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct Coordinator {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn EventSink>,
    pool: SessionWorkerPool,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    accept_poll_interval: Duration,
    shutdown_grace_period: Duration,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(summary) = self.pool.join_next(), if !self.pool.is_empty() => {
                    Self::worker_finished(&summary);
                    continue;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.broker.accept_session(self.accept_poll_interval) => result,
            };

            match accepted {
                Ok(Some(lease)) => {
                    debug!(
                        session_id = %lease.session_id,
                        locked_until = %lease.locked_until,
                        "Session accepted"
                    );
                    if let Err(e) = self.pool.spawn(lease, permit) {
                        warn!(error = %e, "Broker handed out a session that is still bound");
                        if let Err(release) = self.broker.release_session(&e.session_id).await {
                            debug!(error = %release, "Release of duplicate session failed");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to accept session");
                    self.sink
                        .emit(ProcessorEvent::ProcessingError {
                            source: ErrorSource::AcceptSession,
                            session_id: None,
                            message_id: None,
                            cause: e.to_string(),
                        })
                        .await;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.accept_poll_interval) => {}
                    }
                }
            }
        }

        debug!(active = self.pool.len(), "Coordinator stopping; draining workers");
        for summary in self.pool.drain(self.shutdown_grace_period).await {
            Self::worker_finished(&summary);
        }
    }

    fn worker_finished(summary: &SessionSummary) {
        debug!(
            session_id = %summary.session_id,
            slot_id = %summary.slot_id,
            reason = %summary.reason,
            messages = summary.messages_dispatched,
            "Worker slot freed"
        );
    }
}
