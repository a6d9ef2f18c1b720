//! # Property Checks
//!
//! Randomized checks of broker routing and lifecycle ordering.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    use async_trait::async_trait;
    use engine_bus::MessageBroker;
    use engine_runtime::{EngineService, HookError, LifecycleManager, ServiceContext};
    use engine_types::{MessageEnvelope, ServiceDescriptor};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;

    const TOPICS: [&str; 3] = ["Alexa", "Navigation", "Phone"];
    const ACTIONS: [&str; 2] = ["Event", "Query"];

    fn route() -> impl Strategy<Value = (usize, usize)> {
        (0..TOPICS.len(), 0..ACTIONS.len())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Each handler sees exactly the messages of its key, in publish order.
        #[test]
        fn prop_delivery_is_per_key_and_ordered(publishes in prop::collection::vec(route(), 0..60)) {
            let broker = MessageBroker::new();
            let seen: Arc<Mutex<HashMap<(usize, usize), Vec<u64>>>> = Arc::default();

            for t in 0..TOPICS.len() {
                for a in 0..ACTIONS.len() {
                    let seen = Arc::clone(&seen);
                    broker
                        .subscribe_fn(TOPICS[t], ACTIONS[a], "observer", move |envelope| {
                            let seq = envelope.payload()["seq"].as_u64().unwrap_or(u64::MAX);
                            seen.lock().entry((t, a)).or_default().push(seq);
                        })
                        .unwrap();
                }
            }

            let mut expected: HashMap<(usize, usize), Vec<u64>> = HashMap::new();
            for (seq, &(t, a)) in publishes.iter().enumerate() {
                let seq = seq as u64;
                let envelope = MessageEnvelope::publish(TOPICS[t], ACTIONS[a], "1.0", json!({ "seq": seq }));
                let dispatch = broker.publish(envelope).unwrap();
                prop_assert_eq!(dispatch.delivered, 1);
                expected.entry((t, a)).or_default().push(seq);
            }

            prop_assert_eq!(&*seen.lock(), &expected);
            prop_assert_eq!(broker.stats().published, publishes.len() as u64);
        }

        /// Replies with unknown ids are never delivered to subscribers.
        #[test]
        fn prop_unmatched_replies_are_stale(ids in prop::collection::vec("[a-z0-9]{1,12}", 1..20)) {
            let broker = MessageBroker::new();
            let delivered = Arc::new(Mutex::new(0usize));
            let counter = Arc::clone(&delivered);
            broker
                .subscribe_fn("Alexa", "Query", "observer", move |_| *counter.lock() += 1)
                .unwrap();

            for id in &ids {
                let request = MessageEnvelope::request("Alexa", "Query", "1.0", json!({})).with_id(id.as_str());
                let dispatch = broker.publish(request.reply(json!({}))).unwrap();
                prop_assert_eq!(dispatch.delivered, 0);
            }

            prop_assert_eq!(*delivered.lock(), 0);
            prop_assert_eq!(broker.stats().stale_replies, ids.len() as u64);
        }

        /// Every service registers after all of its dependencies.
        #[test]
        fn prop_activation_respects_dependencies(
            edges in prop::collection::vec((0usize..8, 0usize..8), 0..20),
            rotation in 0usize..8,
        ) {
            // Only lower -> higher edges, which keeps the graph acyclic
            let mut deps: Vec<BTreeSet<String>> = vec![BTreeSet::new(); 8];
            for (a, b) in edges {
                if a < b {
                    deps[b].insert(format!("S{a}"));
                }
            }

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let journal = Arc::new(Mutex::new(Vec::new()));

            let manager = LifecycleManager::new(Arc::new(MessageBroker::new()));
            for offset in 0..8 {
                let i = (offset + rotation) % 8;
                manager
                    .submit(
                        ServiceDescriptor::new(format!("S{i}"), "1.0").depends_on(deps[i].iter().cloned()),
                        Arc::new(Journaling { journal: Arc::clone(&journal) }),
                    )
                    .unwrap();
            }

            let report = runtime.block_on(manager.activate()).unwrap();
            let position: HashMap<&str, usize> = report
                .order
                .iter()
                .enumerate()
                .map(|(pos, name)| (name.as_str(), pos))
                .collect();
            for (i, dependencies) in deps.iter().enumerate() {
                let me = position[format!("S{i}").as_str()];
                for dep in dependencies {
                    prop_assert!(position[dep.as_str()] < me);
                }
            }

            // Three hooks per service, in three full passes over the order
            let journal = journal.lock();
            prop_assert_eq!(journal.len(), 24);
            let register_pass: Vec<&String> = journal.iter().take(8).collect();
            prop_assert!(register_pass.iter().all(|entry| entry.ends_with(":register")));
        }
    }

    struct Journaling {
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EngineService for Journaling {
        async fn on_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
            self.journal.lock().push(format!("{}:register", ctx.name()));
            Ok(())
        }

        async fn on_post_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
            self.journal.lock().push(format!("{}:post_register", ctx.name()));
            Ok(())
        }

        async fn on_start(&self, ctx: &ServiceContext) -> Result<(), HookError> {
            self.journal.lock().push(format!("{}:start", ctx.name()));
            Ok(())
        }
    }
}
