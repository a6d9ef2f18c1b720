//! # Lifecycle Flows
//!
//! Services wired through the broker and driven by the lifecycle manager:
//!
//! 1. **Location → Navigation**: Navigation queries Location in post-register
//! 2. **Failure isolation**: a failed provider takes down its dependents only
//! 3. **Runtime engine**: the shipped services boot, serve and stop

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use engine_bus::{MessageBroker, RequestOutcome};
    use engine_runtime::network::{status_changed_envelope, NETWORK_TOPIC};
    use engine_runtime::services::property::{
        get_property_envelope, set_property_envelope, PROPERTY_TOPIC, SET_PROPERTY_ACTION,
    };
    use engine_runtime::{
        Engine, EngineService, FailureCause, HookError, LifecycleError, LifecycleManager,
        LifecyclePhase, ManagerPhase, NetworkStatus, RuntimeConfig, ServiceContext, ServiceState,
    };
    use engine_types::{MessageEnvelope, ServiceDescriptor, ValidationMode};
    use parking_lot::Mutex;
    use serde_json::json;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Answers `Location/GetPosition` from `on_register`.
    struct LocationService {
        fail_register: bool,
    }

    #[async_trait]
    impl EngineService for LocationService {
        async fn on_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
            if self.fail_register {
                return Err(HookError::new("GPS unavailable"));
            }
            let broker = Arc::downgrade(ctx.broker());
            ctx.broker()
                .subscribe_fn("Location", "GetPosition", ctx.subscriber_id(), move |request| {
                    if let Some(broker) = broker.upgrade() {
                        let _ = broker.reply(request.reply(json!({ "lat": 52.52, "lon": 13.40 })));
                    }
                })?;
            Ok(())
        }
        // on_stop left as default: unsubscribe_all releases the handler
    }

    /// Reads the position once Location is guaranteed to be answering.
    struct NavigationService {
        position: Mutex<Option<(f64, f64)>>,
    }

    #[async_trait]
    impl EngineService for NavigationService {
        async fn on_post_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
            let request = MessageEnvelope::request("Location", "GetPosition", "1.0", json!({}));
            let outcome = ctx
                .broker()
                .request_with_timeout(request, Duration::from_millis(200))?
                .await;
            let RequestOutcome::Reply(reply) = outcome else {
                return Err(HookError::new("position request timed out"));
            };
            let payload = reply.payload();
            *self.position.lock() = payload["lat"].as_f64().zip(payload["lon"].as_f64());
            Ok(())
        }
    }

    struct IdleService;

    #[async_trait]
    impl EngineService for IdleService {}

    fn navigation() -> Arc<NavigationService> {
        Arc::new(NavigationService {
            position: Mutex::new(None),
        })
    }

    // =============================================================================
    // CROSS-SERVICE FLOWS
    // =============================================================================

    #[tokio::test]
    async fn test_post_register_can_call_dependency() {
        let broker = Arc::new(MessageBroker::new());
        let manager = LifecycleManager::new(Arc::clone(&broker));
        let nav = navigation();

        // Dependent submitted first: order must still follow the graph
        manager
            .submit(
                ServiceDescriptor::new("Navigation", "1.0").depends_on(["Location"]),
                nav.clone(),
            )
            .unwrap();
        manager
            .submit(
                ServiceDescriptor::new("Location", "1.0"),
                Arc::new(LocationService {
                    fail_register: false,
                }),
            )
            .unwrap();

        let report = manager.activate().await.unwrap();
        assert_eq!(report.order, vec!["Location", "Navigation"]);
        assert_eq!(*nav.position.lock(), Some((52.52, 13.40)));

        manager.deactivate().await.unwrap();
        assert_eq!(broker.subscriber_count("Location", "GetPosition"), 0);
    }

    #[tokio::test]
    async fn test_failed_provider_isolates_dependents() {
        let broker = Arc::new(MessageBroker::new());
        let manager = LifecycleManager::new(Arc::clone(&broker));

        manager
            .submit(
                ServiceDescriptor::new("Location", "1.0"),
                Arc::new(LocationService {
                    fail_register: true,
                }),
            )
            .unwrap();
        manager
            .submit(
                ServiceDescriptor::new("Navigation", "1.0").depends_on(["Location"]),
                navigation(),
            )
            .unwrap();
        manager
            .submit(ServiceDescriptor::new("Media", "1.0"), Arc::new(IdleService))
            .unwrap();

        let err = manager.activate().await.unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].service, "Location");
        assert!(failures[0].is_hook_failure());
        assert_eq!(failures[1].service, "Navigation");
        assert_eq!(failures[1].phase, LifecyclePhase::Register);
        assert_eq!(
            failures[1].cause,
            FailureCause::DependencyFailed {
                dependency: "Location".to_string()
            }
        );

        assert_eq!(manager.state("Media"), Some(ServiceState::Started));
        assert_eq!(manager.phase(), ManagerPhase::Active);
        assert!(!manager.is_healthy());

        // No GetPosition handler was left behind
        assert_eq!(broker.subscriber_count("Location", "GetPosition"), 0);
        manager.deactivate().await.unwrap();
        assert_eq!(manager.state("Media"), Some(ServiceState::Stopped));
        assert_eq!(manager.state("Location"), Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn test_cycle_reported_before_any_hook() {
        let broker = Arc::new(MessageBroker::new());
        let manager = LifecycleManager::new(Arc::clone(&broker));
        let nav = navigation();

        manager
            .submit(
                ServiceDescriptor::new("Navigation", "1.0").depends_on(["Location"]),
                nav.clone(),
            )
            .unwrap();
        manager
            .submit(
                ServiceDescriptor::new("Location", "1.0").depends_on(["Navigation"]),
                Arc::new(LocationService {
                    fail_register: false,
                }),
            )
            .unwrap();

        let err = manager.activate().await.unwrap_err();
        assert!(matches!(err, LifecycleError::DependencyCycle { .. }));
        assert_eq!(manager.phase(), ManagerPhase::Idle);
        assert_eq!(manager.state("Location"), Some(ServiceState::Unregistered));
        assert_eq!(broker.subscriber_count("Location", "GetPosition"), 0);
    }

    // =============================================================================
    // RUNTIME ENGINE
    // =============================================================================

    #[tokio::test]
    async fn test_engine_serves_property_and_network_traffic() {
        let mut config = RuntimeConfig::default();
        config.broker.validation = ValidationMode::Strict;
        let engine = Engine::new(&config).unwrap();
        engine.start().await.unwrap();

        let broker = engine.broker();
        broker
            .publish(set_property_envelope(
                engine_runtime::engine::WATCHED_PROPERTY,
                "ja-JP",
            ))
            .unwrap();
        let reply = broker
            .request(get_property_envelope(engine_runtime::engine::WATCHED_PROPERTY))
            .unwrap()
            .await
            .into_reply()
            .unwrap();
        assert_eq!(reply.payload()["value"], "ja-JP");

        broker
            .publish(status_changed_envelope(NetworkStatus::Disconnecting, 5))
            .unwrap();
        assert_eq!(
            engine.network().network_status(),
            NetworkStatus::Disconnecting
        );

        // Strict mode: unknown message types are refused
        let unknown = MessageEnvelope::publish(NETWORK_TOPIC, "Reboot", "1.0", json!({}));
        assert!(broker.publish(unknown).is_err());

        engine.shutdown().await.unwrap();
        assert_eq!(broker.subscriber_count(PROPERTY_TOPIC, SET_PROPERTY_ACTION), 0);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_shutdown_is_idempotent() {
        let engine = Engine::new(&RuntimeConfig::default()).unwrap();
        engine.start().await.unwrap();

        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(engine.lifecycle().phase(), ManagerPhase::Deactivated);
        assert!(matches!(
            engine.lifecycle().activate().await,
            Err(LifecycleError::AlreadyActivated)
        ));
    }
}
