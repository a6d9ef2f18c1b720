//! The engine service contract.

use async_trait::async_trait;
use engine_bus::{BrokerError, MessageBroker, SubscriberId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct HookError {
    pub reason: String,
}

impl HookError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<BrokerError> for HookError {
    fn from(err: BrokerError) -> Self {
        Self::new(err.to_string())
    }
}

/// What a hook gets to work with.
#[derive(Clone)]
pub struct ServiceContext {
    name: String,
    broker: Arc<MessageBroker>,
}

impl ServiceContext {
    pub(crate) fn new(name: impl Into<String>, broker: Arc<MessageBroker>) -> Self {
        Self {
            name: name.into(),
            broker,
        }
    }

    /// Name of the service the hook belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// Subscriber identity to use for this service's broker registrations.
    pub fn subscriber_id(&self) -> SubscriberId {
        SubscriberId::new(self.name.clone())
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Lifecycle hooks of an engine service.
///
/// - `on_register`: set up own state and broker subscriptions. Dependencies
///   have registered, but may not have post-registered yet.
/// - `on_post_register`: call other services. Every dependency has completed
///   its own post-register.
/// - `on_start`: begin normal operation.
/// - `on_stop`: release resources. Dependents have already stopped.
///
/// Every hook defaults to a no-op.
#[async_trait]
pub trait EngineService: Send + Sync {
    async fn on_register(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_post_register(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_start(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        Ok(())
    }
}
