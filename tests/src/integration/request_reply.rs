//! # Request/Reply Flows
//!
//! A request resolves exactly once: with the first matching reply before its
//! deadline, or with a timeout. Late and duplicate replies are stale.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use engine_bus::{BrokerConfig, MessageBroker, ReplyOutcome, RequestOutcome};
    use engine_types::{
        FieldKind, MessageEnvelope, MessageType, PayloadSchema, SchemaRegistry, ValidationMode,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn echo_request(n: u64) -> MessageEnvelope {
        MessageEnvelope::request("Echo", "Ping", "1.0", json!({ "n": n }))
    }

    /// Broker with a synchronous `Echo/Ping` responder.
    fn echo_broker() -> Arc<MessageBroker> {
        let broker = Arc::new(MessageBroker::new());
        let weak = Arc::downgrade(&broker);
        broker
            .subscribe_fn("Echo", "Ping", "echo", move |request| {
                if let Some(broker) = weak.upgrade() {
                    let reply = request.reply(request.payload().clone());
                    broker.reply(reply).unwrap();
                }
            })
            .unwrap();
        broker
    }

    // =============================================================================
    // CORRELATION
    // =============================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_get_their_own_reply() {
        let broker = echo_broker();

        let tasks: Vec<_> = (0..64u64)
            .map(|n| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let reply = broker
                        .request(echo_request(n))
                        .unwrap()
                        .await
                        .into_reply()
                        .unwrap();
                    (n, reply)
                })
            })
            .collect();

        for task in tasks {
            let (n, reply) = task.await.unwrap();
            assert_eq!(reply.payload()["n"], n);
            assert_eq!(reply.message_type(), MessageType::Reply);
        }

        let stats = broker.stats();
        assert_eq!(stats.requests, 64);
        assert_eq!(stats.replies, 64);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_deferred_reply_from_worker_task() {
        let broker = Arc::new(MessageBroker::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe_fn("Navigation", "GetRoute", "navigation", move |request| {
                let _ = tx.send(request.clone());
            })
            .unwrap();

        let worker_broker = Arc::clone(&broker);
        let worker = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker_broker
                .reply(request.reply(json!({ "distanceKm": 12 })))
                .unwrap()
        });

        let pending = broker
            .request(MessageEnvelope::request(
                "Navigation",
                "GetRoute",
                "1.0",
                json!({ "to": "home" }),
            ))
            .unwrap();
        assert_eq!(broker.pending_count(), 1);

        let reply = pending.await.into_reply().unwrap();
        assert_eq!(reply.payload()["distanceKm"], 12);
        assert_eq!(worker.await.unwrap(), ReplyOutcome::Delivered);
    }

    // =============================================================================
    // DEADLINES
    // =============================================================================

    #[tokio::test]
    async fn test_late_reply_is_stale_and_request_times_out() {
        let broker = Arc::new(MessageBroker::new());
        let held = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&held);
        broker
            .subscribe_fn("Echo", "Ping", "slow", move |request| {
                *sink.lock() = Some(request.clone());
            })
            .unwrap();

        let pending = broker
            .request_with_timeout(echo_request(1), Duration::from_millis(30))
            .unwrap();
        assert_eq!(pending.await, RequestOutcome::Timeout);

        let request = held.lock().take().unwrap();
        let outcome = broker.reply(request.reply(json!({}))).unwrap();
        assert_eq!(outcome, ReplyOutcome::Stale);

        let stats = broker.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.stale_replies, 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_default_timeout_comes_from_config() {
        let broker = MessageBroker::with_config(
            BrokerConfig {
                request_timeout: Duration::from_millis(20),
            },
            Arc::new(SchemaRegistry::default()),
        );

        let dispatch = broker.publish(echo_request(7)).unwrap();
        assert_eq!(dispatch.delivered, 0);
        let outcome = dispatch.reply.unwrap().await;
        assert!(outcome.is_timeout());
    }

    #[tokio::test]
    async fn test_request_id_reusable_after_resolution() {
        let broker = echo_broker();
        let first = echo_request(1).with_id("fixed-id");

        broker.request(first.clone()).unwrap().await.into_reply().unwrap();
        let again = broker.request(first).unwrap().await;
        assert!(!again.is_timeout());
    }

    // =============================================================================
    // WIRE BOUNDARY
    // =============================================================================

    #[tokio::test]
    async fn test_json_envelopes_round_trip_through_broker() {
        let broker = echo_broker();
        let raw = echo_request(42).to_json_string().unwrap();

        let request = MessageEnvelope::from_json_str(&raw).unwrap();
        let reply = broker.request(request).unwrap().await.into_reply().unwrap();

        let wire: serde_json::Value = serde_json::from_str(&reply.to_json_string().unwrap()).unwrap();
        assert_eq!(wire["header"]["messageType"], "Reply");
        assert_eq!(wire["header"]["messageDescription"]["topic"], "Echo");
        assert_eq!(wire["payload"]["n"], 42);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_invalid_reply() {
        let schemas = SchemaRegistry::new(ValidationMode::Strict);
        schemas
            .register(
                "Echo",
                "Ping",
                "1.0",
                PayloadSchema::new().required("n", FieldKind::Integer),
            )
            .unwrap();
        let broker = Arc::new(MessageBroker::with_config(
            BrokerConfig::default(),
            Arc::new(schemas),
        ));

        let pending = broker
            .request_with_timeout(echo_request(3), Duration::from_millis(30))
            .unwrap();
        let request_id = pending.id().clone();

        let bad_reply = MessageEnvelope::request("Echo", "Ping", "1.0", json!({ "n": 3 }))
            .with_id(request_id)
            .reply(json!({ "n": "three" }));
        assert!(broker.reply(bad_reply).is_err());
        assert_eq!(broker.stats().validation_failures, 1);

        assert!(pending.await.is_timeout());
    }
}
