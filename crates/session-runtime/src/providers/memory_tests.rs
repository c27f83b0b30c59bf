//! Tests for the in-memory broker.

use super::*;

fn session(id: &str) -> SessionId {
    SessionId::new(id.to_string()).unwrap()
}

fn message(session_id: &str, id: &str) -> Message {
    Message::new(session(session_id), Bytes::from(format!("body-{}", id)))
        .with_message_id(id.parse().unwrap())
}

fn broker_with_lock(lock_duration: Duration) -> InMemoryBroker {
    InMemoryBroker::new(InMemoryBrokerConfig {
        session_lock_duration: lock_duration,
        max_delivery_count: None,
    })
}

const SHORT: Duration = Duration::from_millis(20);

// ============================================================================
// Session Acceptance
// ============================================================================

mod session_acceptance {
    use super::*;

    /// Verify that an empty broker returns no session after the timeout.
    #[tokio::test]
    async fn test_accept_returns_none_when_empty() {
        let broker = InMemoryBroker::default();

        let lease = broker.accept_session(SHORT).await.unwrap();
        assert!(lease.is_none());
    }

    /// Verify that a session with pending messages is accepted and locked.
    #[tokio::test]
    async fn test_accept_locks_session() {
        let broker = InMemoryBroker::default();
        broker.send(message("S1", "M1"));

        let lease = broker.accept_session(SHORT).await.unwrap().unwrap();
        assert_eq!(lease.session_id, session("S1"));
        assert!(lease.locked_until > Timestamp::now());
        assert!(broker.is_session_locked(&session("S1")));

        // The only session is locked, so nothing else can be accepted
        assert!(broker.accept_session(SHORT).await.unwrap().is_none());
    }

    /// Verify that a waiting accept wakes up when a message arrives.
    #[tokio::test]
    async fn test_accept_wakes_on_send() {
        let broker = InMemoryBroker::default();
        let sender = broker.clone();

        let waiter =
            tokio::spawn(async move { broker.accept_session(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.send(message("S2", "M1"));

        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.session_id, session("S2"));
    }

    /// Verify that an expired lock makes the session acceptable again.
    #[tokio::test]
    async fn test_expired_lock_allows_reaccept() {
        let broker = broker_with_lock(Duration::from_millis(30));
        broker.send(message("S1", "M1"));

        broker.accept_session(SHORT).await.unwrap().unwrap();
        let lease = broker
            .accept_session(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(lease.map(|l| l.session_id), Some(session("S1")));
    }

    /// Verify that an unreachable broker fails every operation.
    #[tokio::test]
    async fn test_unreachable_broker_fails() {
        let broker = InMemoryBroker::default();
        broker.set_reachable(false);

        assert!(matches!(
            broker.check_connection().await,
            Err(BrokerError::Unreachable { .. })
        ));
        assert!(broker.accept_session(SHORT).await.is_err());

        broker.set_reachable(true);
        assert!(broker.check_connection().await.is_ok());
    }
}

// ============================================================================
// Message Delivery
// ============================================================================

mod message_delivery {
    use super::*;

    /// Verify that messages are delivered in FIFO order within a session.
    #[tokio::test]
    async fn test_pull_preserves_order() {
        let broker = InMemoryBroker::default();
        broker.send_batch(vec![
            message("S1", "M1"),
            message("S1", "M2"),
            message("S1", "M3"),
        ]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let mut ids = Vec::new();
        while let Some(received) = broker.pull_message(&s1, SHORT).await.unwrap() {
            assert_eq!(received.delivery_count, 1);
            ids.push(received.message_id.to_string());
            broker
                .report_outcome(&s1, &received, Outcome::Complete)
                .await
                .unwrap();
        }

        assert_eq!(ids, vec!["M1", "M2", "M3"]);
        assert_eq!(broker.settlements().len(), 3);
        assert_eq!(broker.unsettled_count(), 0);
    }

    /// Verify that attributes and correlation id survive delivery and redelivery.
    #[tokio::test]
    async fn test_message_metadata_carried_through() {
        let broker = InMemoryBroker::default();
        broker.send(
            message("S1", "M1")
                .with_attribute("kind".to_string(), "order".to_string())
                .with_correlation_id("order-42"),
        );
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let first = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        assert_eq!(first.correlation_id.as_deref(), Some("order-42"));
        assert_eq!(first.attributes.get("kind").map(String::as_str), Some("order"));
        assert_eq!(first.body_as_str(), Some("body-M1"));

        broker
            .report_outcome(&s1, &first, Outcome::Abandon)
            .await
            .unwrap();
        let second = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.correlation_id.as_deref(), Some("order-42"));
    }

    /// Verify that pulling from a session that is not locked reports lock loss.
    #[tokio::test]
    async fn test_pull_without_lock_fails() {
        let broker = InMemoryBroker::default();
        broker.send(message("S1", "M1"));

        let result = broker.pull_message(&session("S1"), SHORT).await;
        assert!(matches!(result, Err(BrokerError::SessionLockLost { .. })));

        let result = broker.pull_message(&session("missing"), SHORT).await;
        assert!(matches!(result, Err(BrokerError::SessionNotFound { .. })));
    }

    /// Verify that abandon returns the message to the head with a higher delivery count.
    #[tokio::test]
    async fn test_abandon_redelivers_in_order() {
        let broker = InMemoryBroker::default();
        broker.send_batch(vec![message("S1", "M1"), message("S1", "M2")]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let first = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        broker
            .report_outcome(&s1, &first, Outcome::Abandon)
            .await
            .unwrap();

        let again = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        assert_eq!(again.message_id.as_str(), "M1");
        assert_eq!(again.delivery_count, 2);
        assert_ne!(again.lock_token, first.lock_token);
    }

    /// Verify that a prefetched message abandoned after its successor keeps its position.
    #[tokio::test]
    async fn test_abandon_out_of_order_restores_sequence() {
        let broker = InMemoryBroker::default();
        broker.send_batch(vec![message("S1", "M1"), message("S1", "M2")]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let m1 = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        let m2 = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        broker.report_outcome(&s1, &m2, Outcome::Abandon).await.unwrap();
        broker.report_outcome(&s1, &m1, Outcome::Abandon).await.unwrap();

        let next = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        assert_eq!(next.message_id.as_str(), "M1");
    }

    /// Verify that each delivery can only be settled once.
    #[tokio::test]
    async fn test_double_settlement_rejected() {
        let broker = InMemoryBroker::default();
        broker.send(message("S1", "M1"));
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let received = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        broker
            .report_outcome(&s1, &received, Outcome::Complete)
            .await
            .unwrap();

        let second = broker.report_outcome(&s1, &received, Outcome::Abandon).await;
        assert!(matches!(second, Err(BrokerError::MessageLockLost { .. })));
        assert_eq!(broker.settlements().len(), 1);
    }

    /// Verify that dead-lettering moves the message to the dead-letter store.
    #[tokio::test]
    async fn test_dead_letter_store() {
        let broker = InMemoryBroker::default();
        broker.send(message("S1", "M1"));
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let received = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        broker
            .report_outcome(
                &s1,
                &received,
                Outcome::DeadLetter {
                    reason: "poison".to_string(),
                },
            )
            .await
            .unwrap();

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id.as_str(), "M1");
        assert_eq!(dead[0].reason, "poison");
        assert_eq!(broker.pending_count(&s1), 0);
    }

    /// Verify broker-side dead-lettering once the delivery count is exceeded.
    #[tokio::test]
    async fn test_broker_max_delivery_count() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            max_delivery_count: Some(1),
            ..Default::default()
        });
        broker.send_batch(vec![message("S1", "M1"), message("S1", "M2")]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        let m1 = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        broker.report_outcome(&s1, &m1, Outcome::Abandon).await.unwrap();

        // M1 would be delivered a second time, so it is dead-lettered instead
        let next = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();
        assert_eq!(next.message_id.as_str(), "M2");
        assert_eq!(broker.dead_letters()[0].reason, "MaxDeliveryCountExceeded");
    }
}

// ============================================================================
// Lock Management
// ============================================================================

mod lock_management {
    use super::*;

    /// Verify that renewal extends the lock beyond its original expiry.
    #[tokio::test]
    async fn test_renew_extends_lock() {
        let broker = broker_with_lock(Duration::from_millis(80));
        broker.send(message("S1", "M1"));
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let renewed = broker.renew_session_lock(&s1).await.unwrap();
        assert!(renewed > Timestamp::now());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.is_session_locked(&s1));
    }

    /// Verify injected renewal failures surface as lock loss and free the session.
    #[tokio::test]
    async fn test_failed_renewal_reports_lock_lost() {
        let broker = InMemoryBroker::default();
        broker.send(message("S1", "M1"));
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();
        let received = broker.pull_message(&s1, SHORT).await.unwrap().unwrap();

        broker.fail_lock_renewals(&s1);
        let result = broker.renew_session_lock(&s1).await;
        assert!(matches!(result, Err(BrokerError::SessionLockLost { .. })));
        assert!(!broker.is_session_locked(&s1));

        // The in-flight message went back to the session
        assert_eq!(broker.pending_count(&s1), 1);
        let settle = broker.report_outcome(&s1, &received, Outcome::Complete).await;
        assert!(settle.unwrap_err().is_lock_lost());
    }

    /// Verify that a forced expiry is observed by the lock holder.
    #[tokio::test]
    async fn test_expire_session_lock() {
        let broker = InMemoryBroker::default();
        broker.send_batch(vec![message("S1", "M1"), message("S1", "M2")]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();

        broker.expire_session_lock(&s1);

        let result = broker.pull_message(&s1, SHORT).await;
        assert!(result.unwrap_err().is_lock_lost());
        assert_eq!(broker.pending_count(&s1), 2);
    }

    /// Verify release unlocks the session and returns unsettled messages.
    #[tokio::test]
    async fn test_release_session() {
        let broker = InMemoryBroker::default();
        broker.send_batch(vec![message("S1", "M1"), message("S1", "M2")]);
        let s1 = session("S1");
        broker.accept_session(SHORT).await.unwrap().unwrap();
        broker.pull_message(&s1, SHORT).await.unwrap().unwrap();

        broker.release_session(&s1).await.unwrap();
        assert!(!broker.is_session_locked(&s1));
        assert_eq!(broker.pending_count(&s1), 2);

        // Releasing again fails because the lock is gone
        assert!(broker.release_session(&s1).await.is_err());
    }
}
