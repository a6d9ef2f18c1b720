//! Client of the property manager.
//!
//! Reads a property during post-register (when the property manager is
//! guaranteed to be answering) and follows `PropertyChanged` afterwards.

use super::property::{get_property_envelope, PROPERTY_CHANGED_ACTION, PROPERTY_TOPIC};
use crate::lifecycle::{EngineService, HookError, ServiceContext};
use async_trait::async_trait;
use engine_bus::{RequestOutcome, SubscriptionHandle};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Watches one property of the property manager.
pub struct PropertyClientService {
    property: String,
    timeout: Duration,
    value: Arc<RwLock<Option<String>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PropertyClientService {
    pub const NAME: &'static str = "PropertyClient";

    pub fn new(property: impl Into<String>, timeout: Duration) -> Self {
        Self {
            property: property.into(),
            timeout,
            value: Arc::new(RwLock::new(None)),
            subscription: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Last known value of the watched property.
    pub fn value(&self) -> Option<String> {
        self.value.read().clone()
    }
}

#[async_trait]
impl EngineService for PropertyClientService {
    async fn on_post_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let pending = ctx
            .broker()
            .request_with_timeout(get_property_envelope(&self.property), self.timeout)?;

        match pending.await {
            RequestOutcome::Reply(reply) => {
                let value = reply.payload()["value"].as_str().map(str::to_string);
                info!(property = %self.property, value = ?value, "Property read");
                *self.value.write() = value;
                Ok(())
            }
            RequestOutcome::Timeout => Err(HookError::new(format!(
                "GetProperty {} timed out",
                self.property
            ))),
        }
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let (handle, mut changes) = ctx.broker().subscribe_stream(
            PROPERTY_TOPIC,
            PROPERTY_CHANGED_ACTION,
            ctx.subscriber_id(),
        )?;
        *self.subscription.lock() = Some(handle);

        let property = self.property.clone();
        let value = Arc::clone(&self.value);
        let task = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let payload = change.payload();
                if payload["name"].as_str() != Some(property.as_str()) {
                    continue;
                }
                let updated = payload["value"].as_str().map(str::to_string);
                debug!(property = %property, value = ?updated, "Property changed");
                *value.write() = updated;
            }
        });
        *self.watcher.lock() = Some(task);
        Ok(())
    }

    async fn on_stop(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        if let Some(handle) = self.subscription.lock().take() {
            ctx.broker().unsubscribe(&handle);
        }
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::property::{set_property_envelope, PropertyManagerService};
    use engine_bus::MessageBroker;

    #[tokio::test]
    async fn test_reads_then_follows_property() {
        let broker = Arc::new(MessageBroker::new());
        let manager = PropertyManagerService::new([("locale", "en-US")]);
        let manager_ctx = ServiceContext::new(PropertyManagerService::NAME, Arc::clone(&broker));
        manager.on_register(&manager_ctx).await.unwrap();

        let client = PropertyClientService::new("locale", Duration::from_secs(1));
        let ctx = ServiceContext::new(PropertyClientService::NAME, Arc::clone(&broker));
        client.on_post_register(&ctx).await.unwrap();
        assert_eq!(client.value().as_deref(), Some("en-US"));

        client.on_start(&ctx).await.unwrap();
        broker.publish(set_property_envelope("locale", "fr-FR")).unwrap();

        for _ in 0..50 {
            if client.value().as_deref() == Some("fr-FR") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.value().as_deref(), Some("fr-FR"));

        client.on_stop(&ctx).await.unwrap();
        assert_eq!(broker.subscriber_count(PROPERTY_TOPIC, PROPERTY_CHANGED_ACTION), 0);
    }

    #[tokio::test]
    async fn test_post_register_fails_without_manager() {
        let broker = Arc::new(MessageBroker::new());
        let client = PropertyClientService::new("locale", Duration::from_millis(20));
        let ctx = ServiceContext::new(PropertyClientService::NAME, broker);

        let err = client.on_post_register(&ctx).await.unwrap_err();
        assert!(err.reason.contains("timed out"));
    }
}
