//! Tests for the session processor lifecycle and coordination.

use super::*;
use crate::config::RetrySettings;
use crate::dispatcher::handler_fn;
use crate::error::{BrokerError, ConfigError};
use crate::events::{ChannelEventSink, CloseReason};
use crate::message::{Message, Outcome};
use crate::providers::{InMemoryBroker, InMemoryBrokerConfig};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

fn fast_config(max_concurrent_sessions: usize) -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent_sessions,
        session_idle_timeout_ms: 30,
        accept_poll_interval_ms: 20,
        shutdown_grace_period_ms: 1_000,
        retry: RetrySettings {
            max_retries: 1,
            delay_ms: 5,
            max_delay_ms: 5,
            try_timeout_ms: 1_000,
        },
        ..ProcessorConfig::default()
    }
}

fn noop_handler() -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(|_message| async { Ok(()) }))
}

fn channel_sink() -> (Arc<dyn EventSink>, mpsc::Receiver<ProcessorEvent>) {
    let (sink, receiver) = ChannelEventSink::new(4096, Duration::from_secs(1));
    (Arc::new(sink), receiver)
}

fn drain(receiver: &mut mpsc::Receiver<ProcessorEvent>) -> Vec<ProcessorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_until_settled(broker: &InMemoryBroker) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.unsettled_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all messages should be settled");
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ProcessorConfig {
            max_concurrent_sessions: 0,
            ..ProcessorConfig::default()
        };
        let (sink, _events) = channel_sink();

        let result = SessionProcessor::new(
            Arc::new(InMemoryBroker::default()),
            noop_handler(),
            config,
            sink,
        );

        assert!(matches!(
            result,
            Err(ProcessorError::Config(ConfigError::Invalid { .. }))
        ));
    }

    /// Verify an unreachable broker fails start and leaves the processor idle.
    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::default();
        broker.set_reachable(false);
        let (sink, _events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), noop_handler(), fast_config(1), sink)
                .unwrap();

        let err = assert_err!(processor.start().await);
        assert!(matches!(
            err,
            ProcessorError::Startup {
                source: BrokerError::Unreachable { .. }
            }
        ));
        assert!(!processor.is_running().await);

        broker.set_reachable(true);
        assert_ok!(processor.start().await);
        assert!(processor.is_running().await);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (sink, _events) = channel_sink();
        let processor = SessionProcessor::new(
            Arc::new(InMemoryBroker::default()),
            noop_handler(),
            fast_config(1),
            sink,
        )
        .unwrap();

        processor.start().await.unwrap();
        assert!(matches!(
            processor.start().await,
            Err(ProcessorError::AlreadyStarted)
        ));
        processor.stop().await;
    }

    /// Verify stop is idempotent and a stopped processor cannot restart.
    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (sink, _events) = channel_sink();
        let processor = SessionProcessor::new(
            Arc::new(InMemoryBroker::default()),
            noop_handler(),
            fast_config(1),
            sink,
        )
        .unwrap();

        processor.start().await.unwrap();
        processor.stop().await;
        processor.stop().await;

        assert!(!processor.is_running().await);
        assert!(matches!(
            processor.start().await,
            Err(ProcessorError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (sink, _events) = channel_sink();
        let processor = SessionProcessor::new(
            Arc::new(InMemoryBroker::default()),
            noop_handler(),
            fast_config(1),
            sink,
        )
        .unwrap();

        processor.stop().await;
        assert!(!processor.is_running().await);
        assert!(processor.active_sessions().await.is_empty());
    }

    /// Verify run_until stops once the signal resolves.
    #[tokio::test]
    async fn test_run_until_signal() {
        let broker = InMemoryBroker::default();
        broker.send(Message::new(session("S1"), Bytes::from_static(b"m1")));
        let (sink, _events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), noop_handler(), fast_config(1), sink)
                .unwrap();

        processor
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(!processor.is_running().await);
        assert_eq!(broker.unsettled_count(), 0);
    }
}

mod coordination_tests {
    use super::*;

    /// Verify every session is processed and closed.
    #[tokio::test]
    async fn test_processes_all_sessions() {
        let broker = InMemoryBroker::default();
        for session_id in ["A", "B", "C"] {
            for n in 0..3 {
                broker.send(Message::new(
                    session(session_id),
                    Bytes::from(format!("{}-{}", session_id, n)),
                ));
            }
        }
        let (sink, mut events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), noop_handler(), fast_config(2), sink)
                .unwrap();

        processor.start().await.unwrap();
        wait_until_settled(&broker).await;
        processor.stop().await;

        let completed = broker
            .settlements()
            .iter()
            .filter(|s| s.outcome == Outcome::Complete)
            .count();
        assert_eq!(completed, 9);

        let closed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ProcessorEvent::SessionClosed { .. }))
            .count();
        assert_eq!(closed, 3);
    }

    /// Verify no more than max_concurrent_sessions sessions are active at once.
    #[tokio::test]
    async fn test_concurrency_bounded() {
        let broker = InMemoryBroker::default();
        for n in 0..6 {
            broker.send(Message::new(
                session(&format!("S{}", n)),
                Bytes::from_static(b"work"),
            ));
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current_c, peak_c) = (Arc::clone(&current), Arc::clone(&peak));
        let handler = Arc::new(handler_fn(move |_message| {
            let current = Arc::clone(&current_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let (sink, _events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), handler, fast_config(2), sink).unwrap();

        processor.start().await.unwrap();
        wait_until_settled(&broker).await;
        processor.stop().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    /// Verify active sessions are visible while they are being processed.
    #[tokio::test]
    async fn test_active_sessions_reported() {
        let broker = InMemoryBroker::default();
        broker.send(Message::new(session("S1"), Bytes::from_static(b"slow")));
        let handler = Arc::new(handler_fn(|_message| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }));
        let (sink, _events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), handler, fast_config(1), sink).unwrap();

        processor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(processor.active_sessions().await, vec![session("S1")]);

        processor.stop().await;
        assert!(processor.active_sessions().await.is_empty());
    }

    /// Verify accept failures are reported and do not stop the processor.
    #[tokio::test]
    async fn test_accept_failure_reported() {
        let broker = InMemoryBroker::default();
        let (sink, mut events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), noop_handler(), fast_config(1), sink)
                .unwrap();

        processor.start().await.unwrap();
        broker.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.set_reachable(true);

        broker.send(Message::new(session("S1"), Bytes::from_static(b"m1")));
        wait_until_settled(&broker).await;
        assert!(processor.is_running().await);
        processor.stop().await;

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::ProcessingError {
                source: ErrorSource::AcceptSession,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ProcessorEvent::SessionClosed {
                reason: CloseReason::Completed,
                ..
            }
        )));
    }

    /// Verify stop releases sessions that still have messages.
    #[tokio::test]
    async fn test_stop_releases_sessions() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig::default());
        for n in 0..5 {
            broker.send(Message::new(session("S1"), Bytes::from(format!("m{}", n))));
        }
        let handler = Arc::new(handler_fn(|_message| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }));
        let (sink, mut events) = channel_sink();
        let processor =
            SessionProcessor::new(Arc::new(broker.clone()), handler, fast_config(1), sink).unwrap();

        processor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        processor.stop().await;

        assert!(!broker.is_session_locked(&session("S1")));
        assert!(broker.pending_count(&session("S1")) > 0);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            ProcessorEvent::SessionClosed {
                reason: CloseReason::Shutdown,
                ..
            }
        )));
    }

    /// Verify introspection answers while stop waits for in-flight work.
    #[tokio::test]
    async fn test_introspection_during_stop() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig::default());
        broker.send(Message::new(session("S1"), Bytes::from_static(b"slow")));
        let handler = Arc::new(handler_fn(|_message| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(())
        }));
        let (sink, _events) = channel_sink();
        let processor = Arc::new(
            SessionProcessor::new(Arc::new(broker.clone()), handler, fast_config(1), sink).unwrap(),
        );

        processor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = Arc::clone(&processor);
        let stop = tokio::spawn(async move { stopping.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let running = tokio::time::timeout(Duration::from_millis(100), processor.is_running())
            .await
            .expect("is_running should not wait for stop");
        assert!(!running);
        let active = tokio::time::timeout(Duration::from_millis(100), processor.active_sessions())
            .await
            .expect("active_sessions should not wait for stop");
        assert_eq!(active, vec![session("S1")]);

        // A second stop while draining returns without waiting
        tokio::time::timeout(Duration::from_millis(100), processor.stop())
            .await
            .expect("concurrent stop should return at once");
        assert!(matches!(processor.start().await, Err(ProcessorError::Stopped)));

        stop.await.unwrap();
        assert!(processor.active_sessions().await.is_empty());
        assert_eq!(broker.unsettled_count(), 0);
    }
}
