//! # Session Runtime
//!
//! Session-affinity message processing engine with automatic lock renewal,
//! per-session ordering and retry.
//!
//! This library provides:
//! - Concurrent processing of many sessions, bounded by a session semaphore
//! - Strictly ordered, one-at-a-time handling within each session
//! - Background renewal of session locks with a configurable time budget
//! - Handler retries with exponential backoff and per-attempt timeouts
//! - Exactly-once settlement of every received message
//! - Lifecycle and error events through a pluggable event sink
//!
//! ## Module Organization
//!
//! - [`broker`] - The broker abstraction the engine talks to
//! - [`providers`] - Broker implementations (in-memory)
//! - [`processor`] - Top-level coordinator and lifecycle
//! - [`worker`] - Session workers and the worker pool
//! - [`lock_renewer`] - Automatic session lock renewal
//! - [`dispatcher`] - Handler invocation, retry and settlement
//! - [`events`] - Processor events and sinks
//! - [`config`] - Processor configuration and validation
//! - [`retry`] - Retry policy calculations
//! - [`error`] - Error types
//! - [`message`] - Message, session and settlement types

// Module declarations
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lock_renewer;
pub mod message;
pub mod processor;
pub mod providers;
pub mod retry;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use broker::Broker;
pub use config::{ProcessorConfig, RetrySettings};
pub use dispatcher::{handler_fn, DispatchReport, MessageDispatcher, MessageHandler};
pub use error::{
    BrokerError, ConfigError, ErrorSource, HandlerError, ProcessorError, ValidationError,
};
pub use events::{
    ChannelEventSink, CloseReason, EventRecord, EventSink, FanoutEventSink, ProcessorEvent,
    TracingEventSink,
};
pub use lock_renewer::{LockRenewer, SessionLockHandle};
pub use message::{
    LockToken, Message, MessageId, Outcome, ReceivedMessage, SessionId, SessionLease, Timestamp,
};
pub use processor::SessionProcessor;
pub use providers::{InMemoryBroker, InMemoryBrokerConfig};
pub use retry::{RetryPolicy, RetryState};
pub use worker::{SessionSummary, SessionWorkerPool, WorkerSettings};
