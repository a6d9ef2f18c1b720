//! The assembled engine: broker, schemas, and the default service set.

use crate::config::RuntimeConfig;
use crate::lifecycle::{ActivationReport, LifecycleError, LifecycleManager};
use crate::network::{register_network_schemas, NetworkInfoProvider, NetworkInfoService};
use crate::services::{register_property_schemas, PropertyClientService, PropertyManagerService};
use engine_bus::MessageBroker;
use engine_telemetry::log_event;
use engine_types::{SchemaError, ServiceDescriptor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Property the client service reads at startup.
pub const WATCHED_PROPERTY: &str = "aace.core.locale";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Schema registration failed: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Broker plus lifecycle manager with the built-in services submitted.
pub struct Engine {
    broker: Arc<MessageBroker>,
    lifecycle: LifecycleManager,
    network: Arc<NetworkInfoProvider>,
}

impl Engine {
    /// Build the broker from `config`, register schemas, and submit:
    ///
    /// - `NetworkInfo`
    /// - `PropertyManager`
    /// - `PropertyClient` (depends on `PropertyManager`)
    pub fn new(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let schemas = config.broker.schema_registry();
        register_network_schemas(&schemas)?;
        register_property_schemas(&schemas)?;

        let broker = Arc::new(MessageBroker::with_config(
            config.broker.broker_config(),
            Arc::new(schemas),
        ));
        let lifecycle = LifecycleManager::new(Arc::clone(&broker));
        let network = Arc::new(NetworkInfoProvider::new());

        lifecycle.submit(
            ServiceDescriptor::new(NetworkInfoService::NAME, "1.0"),
            Arc::new(NetworkInfoService::new(Arc::clone(&network))),
        )?;
        lifecycle.submit(
            ServiceDescriptor::new(PropertyManagerService::NAME, "3.2"),
            Arc::new(PropertyManagerService::new([(WATCHED_PROPERTY, "en-US")])),
        )?;
        lifecycle.submit(
            ServiceDescriptor::new(PropertyClientService::NAME, "1.0")
                .depends_on([PropertyManagerService::NAME]),
            Arc::new(PropertyClientService::new(
                WATCHED_PROPERTY,
                Duration::from_millis(config.broker.request_timeout_ms),
            )),
        )?;

        Ok(Self {
            broker,
            lifecycle,
            network,
        })
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn network(&self) -> &Arc<NetworkInfoProvider> {
        &self.network
    }

    pub async fn start(&self) -> Result<ActivationReport, LifecycleError> {
        log_event!(info, "engine", "Starting engine");
        let report = self.lifecycle.activate().await;
        self.lifecycle.print_status();
        report
    }

    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        log_event!(info, "engine", "Stopping engine");
        let result = self.lifecycle.deactivate().await;
        let stats = self.broker.stats();
        log_event!(
            info,
            "engine",
            "Broker totals",
            published = stats.published,
            delivered = stats.delivered,
            requests = stats.requests,
            timeouts = stats.timeouts,
            stale_replies = stats.stale_replies
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{ManagerPhase, ServiceState};
    use crate::network::{status_changed_envelope, NetworkStatus};
    use engine_types::ValidationMode;

    #[tokio::test]
    async fn test_engine_boots_and_stops() {
        let mut config = RuntimeConfig::default();
        config.broker.validation = ValidationMode::Strict;
        let engine = Engine::new(&config).unwrap();

        let report = engine.start().await.unwrap();
        assert_eq!(
            report.order,
            vec!["NetworkInfo", "PropertyManager", "PropertyClient"]
        );
        assert!(engine.lifecycle().is_healthy());

        engine
            .broker()
            .publish(status_changed_envelope(NetworkStatus::Connected, 64))
            .unwrap();
        assert_eq!(engine.network().network_status(), NetworkStatus::Connected);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.lifecycle().phase(), ManagerPhase::Deactivated);
        assert_eq!(
            engine.lifecycle().state(PropertyManagerService::NAME),
            Some(ServiceState::Stopped)
        );
        assert_eq!(engine.broker().subscriber_count("Network", "NetworkStatusChanged"), 0);
    }
}
