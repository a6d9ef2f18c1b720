//! # Service Lifecycle Manager
//!
//! Activates engine services in dependency order and stops them in reverse.
//!
//! ## Per-service state machine
//!
//! ```text
//! Unregistered ──► Registered ──► PostRegistered ──► Started ──► Stopped
//!       │               │                │               │
//!       └───────────────┴────────────────┴───────────────┴──► Failed
//! ```
//!
//! ## Activation
//!
//! 1. Resolve the dependency graph: cycles, then unknown names. Either error
//!    leaves every service `Unregistered`.
//! 2. Walk the topological order three times: `on_register`, then
//!    `on_post_register`, then `on_start`.
//! 3. A hook failure marks the service `Failed`. Its dependents are marked
//!    `Failed` when their turn comes; unrelated services carry on. A hook
//!    that panics counts as a failed hook.
//!
//! All failures are returned together in `LifecycleError::Activation`.

mod error;
mod graph;
mod service;

pub use error::{FailureCause, LifecycleError, ServiceFailure};
pub use service::{EngineService, HookError, ServiceContext};

use engine_bus::{MessageBroker, SubscriberId};
use engine_telemetry::{log_service_event, SERVICES_STARTED, SERVICE_TRANSITIONS};
use engine_types::ServiceDescriptor;
use futures::FutureExt;
use graph::GraphNode;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// State of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Unregistered,
    Registered,
    PostRegistered,
    Started,
    Stopped,
    Failed,
}

impl ServiceState {
    /// States from which `on_stop` is invoked on deactivation.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, Self::Registered | Self::PostRegistered | Self::Started)
    }
}

/// Lifecycle hook being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Register,
    PostRegister,
    Start,
    Stop,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::PostRegister => "post_register",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    /// State a service must be in for this phase to run its hook.
    fn precondition(&self) -> ServiceState {
        match self {
            Self::Register => ServiceState::Unregistered,
            Self::PostRegister => ServiceState::Registered,
            Self::Start => ServiceState::PostRegistered,
            Self::Stop => ServiceState::Started,
        }
    }

    /// State reached when the hook succeeds.
    fn outcome(&self) -> ServiceState {
        match self {
            Self::Register => ServiceState::Registered,
            Self::PostRegister => ServiceState::PostRegistered,
            Self::Start => ServiceState::Started,
            Self::Stop => ServiceState::Stopped,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the manager as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    /// Accepting submissions.
    Idle,
    Activating,
    /// Activation finished (possibly with failures).
    Active,
    Deactivating,
    Deactivated,
}

/// Result of a fully successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Service names in activation order.
    pub order: Vec<String>,
}

struct ServiceNode {
    descriptor: ServiceDescriptor,
    service: Arc<dyn EngineService>,
    state: ServiceState,
    failure: Option<ServiceFailure>,
}

/// Owns the submitted services and drives their lifecycle.
pub struct LifecycleManager {
    broker: Arc<MessageBroker>,
    /// Submission order.
    nodes: RwLock<Vec<ServiceNode>>,
    /// Indices into `nodes`, set once the graph resolves.
    order: RwLock<Vec<usize>>,
    phase: Mutex<ManagerPhase>,
}

impl LifecycleManager {
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self {
            broker,
            nodes: RwLock::new(Vec::new()),
            order: RwLock::new(Vec::new()),
            phase: Mutex::new(ManagerPhase::Idle),
        }
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    /// Add a service. Only allowed before activation begins.
    ///
    /// # Errors
    ///
    /// - `ActivationInProgress` - activation has begun
    /// - `InvalidDescriptor` - empty name or self-dependency
    /// - `DuplicateService` - the name is taken
    pub fn submit(
        &self,
        descriptor: ServiceDescriptor,
        service: Arc<dyn EngineService>,
    ) -> Result<(), LifecycleError> {
        // Held across the insert so activation cannot start in between
        let phase = self.phase.lock();
        if *phase != ManagerPhase::Idle {
            return Err(LifecycleError::ActivationInProgress);
        }

        descriptor.validate()?;

        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.descriptor == descriptor) {
            return Err(LifecycleError::DuplicateService {
                name: descriptor.name().to_string(),
            });
        }

        info!(
            service = descriptor.name(),
            version = descriptor.version(),
            dependencies = ?descriptor.dependencies(),
            "Service submitted"
        );
        nodes.push(ServiceNode {
            descriptor,
            service,
            state: ServiceState::Unregistered,
            failure: None,
        });
        Ok(())
    }

    /// Run register, post-register and start over every submitted service.
    ///
    /// # Errors
    ///
    /// - `ActivationInProgress` / `AlreadyActivated` - wrong manager phase
    /// - `DependencyCycle` / `UnresolvedDependency` - nothing was run
    /// - `Activation` - some services did not start; the rest did
    pub async fn activate(&self) -> Result<ActivationReport, LifecycleError> {
        self.begin(ManagerPhase::Activating)?;

        let order = {
            let nodes = self.nodes.read();
            let graph: Vec<GraphNode<'_>> = nodes
                .iter()
                .map(|n| GraphNode {
                    name: n.descriptor.name(),
                    dependencies: n.descriptor.dependencies(),
                })
                .collect();
            graph::resolve(&graph)
        };
        let order = match order {
            Ok(order) => order,
            Err(err) => {
                warn!(error = %err, "Dependency resolution failed");
                *self.phase.lock() = ManagerPhase::Idle;
                return Err(err);
            }
        };
        *self.order.write() = order.clone();

        let names = self.names(&order);
        info!(order = ?names, "Activating services");

        let mut failures = Vec::new();
        for phase in [
            LifecyclePhase::Register,
            LifecyclePhase::PostRegister,
            LifecyclePhase::Start,
        ] {
            for &idx in &order {
                if let Some(failure) = self.advance(idx, phase).await {
                    failures.push(failure);
                }
            }
        }

        *self.phase.lock() = ManagerPhase::Active;
        self.update_started_gauge();

        if failures.is_empty() {
            info!(services = names.len(), "All services started");
            Ok(ActivationReport { order: names })
        } else {
            warn!(failed = failures.len(), "Activation completed with failures");
            Err(LifecycleError::Activation { failures })
        }
    }

    /// Stop every registered service in reverse activation order.
    ///
    /// Best effort: a failing `on_stop` is recorded and the remaining
    /// services are still stopped. Each service's broker subscriptions are
    /// removed after its `on_stop`, whatever its state.
    pub async fn deactivate(&self) -> Result<(), LifecycleError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                ManagerPhase::Active => *phase = ManagerPhase::Deactivating,
                ManagerPhase::Deactivated => return Ok(()),
                ManagerPhase::Idle => return Err(LifecycleError::NotActivated),
                ManagerPhase::Activating | ManagerPhase::Deactivating => {
                    return Err(LifecycleError::ActivationInProgress)
                }
            }
        }

        let order = self.order.read().clone();
        info!(services = order.len(), "Deactivating services");

        let mut failures = Vec::new();
        for &idx in order.iter().rev() {
            if let Some(failure) = self.stop(idx).await {
                failures.push(failure);
            }
        }

        *self.phase.lock() = ManagerPhase::Deactivated;
        self.update_started_gauge();

        if failures.is_empty() {
            info!("All services stopped");
            Ok(())
        } else {
            Err(LifecycleError::Deactivation { failures })
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn phase(&self) -> ManagerPhase {
        *self.phase.lock()
    }

    /// State of a submitted service.
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.descriptor.name() == name)
            .map(|n| n.state)
    }

    /// Every service with its state, in submission order.
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.nodes
            .read()
            .iter()
            .map(|n| (n.descriptor.name().to_string(), n.state))
            .collect()
    }

    /// Why a service failed, if it did.
    pub fn failure(&self, name: &str) -> Option<ServiceFailure> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.descriptor.name() == name)
            .and_then(|n| n.failure.clone())
    }

    /// Activation order. Empty until the graph has been resolved.
    pub fn activation_order(&self) -> Vec<String> {
        let order = self.order.read().clone();
        self.names(&order)
    }

    /// Whether activation finished and every service is `Started`.
    pub fn is_healthy(&self) -> bool {
        self.phase() == ManagerPhase::Active
            && self
                .nodes
                .read()
                .iter()
                .all(|n| n.state == ServiceState::Started)
    }

    /// Log a status table.
    pub fn print_status(&self) {
        info!("===========================================");
        info!("  ENGINE SERVICE STATUS ({:?})", self.phase());
        info!("===========================================");

        let nodes = self.nodes.read();
        let order = self.order.read();
        let listing: Vec<usize> = if order.is_empty() {
            (0..nodes.len()).collect()
        } else {
            order.clone()
        };

        for idx in listing {
            let node = &nodes[idx];
            let icon = match node.state {
                ServiceState::Started => "✅",
                ServiceState::Failed => "❌",
                ServiceState::Stopped => "⏹️ ",
                _ => "⏳",
            };
            info!(
                "  {} {:30} v{:8} {:?}",
                icon,
                node.descriptor.name(),
                node.descriptor.version(),
                node.state
            );
            if let Some(failure) = &node.failure {
                info!("       {}", failure);
            }
        }

        info!("===========================================");
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn begin(&self, next: ManagerPhase) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock();
        match *phase {
            ManagerPhase::Idle => {
                *phase = next;
                Ok(())
            }
            ManagerPhase::Activating | ManagerPhase::Deactivating => {
                Err(LifecycleError::ActivationInProgress)
            }
            ManagerPhase::Active | ManagerPhase::Deactivated => {
                Err(LifecycleError::AlreadyActivated)
            }
        }
    }

    fn names(&self, order: &[usize]) -> Vec<String> {
        let nodes = self.nodes.read();
        order
            .iter()
            .map(|&i| nodes[i].descriptor.name().to_string())
            .collect()
    }

    /// Run one activation phase for one service. Returns its failure, if any.
    async fn advance(&self, idx: usize, phase: LifecyclePhase) -> Option<ServiceFailure> {
        // Clone out what the hook needs; no lock is held across the await.
        let (name, service, blocked_by) = {
            let nodes = self.nodes.read();
            let node = &nodes[idx];
            if node.state != phase.precondition() {
                // Failed in an earlier phase, already reported
                return None;
            }
            let blocked_by = node.descriptor.dependencies().iter().find(|dep| {
                nodes
                    .iter()
                    .find(|n| n.descriptor.name() == dep.as_str())
                    .map_or(true, |n| n.state != phase.outcome())
            });
            (
                node.descriptor.name().to_string(),
                Arc::clone(&node.service),
                blocked_by.cloned(),
            )
        };

        if let Some(dependency) = blocked_by {
            log_service_event!(warn, name, phase, "Skipped: dependency not ready", dependency = %dependency);
            SERVICE_TRANSITIONS
                .with_label_values(&[phase.as_str(), "skipped"])
                .inc();
            let failure = ServiceFailure {
                service: name,
                phase,
                cause: FailureCause::DependencyFailed { dependency },
            };
            self.record_failure(idx, failure.clone());
            return Some(failure);
        }

        let ctx = ServiceContext::new(name.clone(), Arc::clone(&self.broker));
        match run_hook(&service, phase, &ctx).await {
            Ok(()) => {
                log_service_event!(info, name, phase, "Hook completed");
                SERVICE_TRANSITIONS
                    .with_label_values(&[phase.as_str(), "ok"])
                    .inc();
                self.nodes.write()[idx].state = phase.outcome();
                None
            }
            Err(err) => {
                log_service_event!(error, name, phase, "Hook failed", reason = %err);
                SERVICE_TRANSITIONS
                    .with_label_values(&[phase.as_str(), "failed"])
                    .inc();
                let failure = ServiceFailure {
                    service: name,
                    phase,
                    cause: FailureCause::Hook { reason: err.reason },
                };
                self.record_failure(idx, failure.clone());
                Some(failure)
            }
        }
    }

    async fn stop(&self, idx: usize) -> Option<ServiceFailure> {
        let (name, service, state) = {
            let nodes = self.nodes.read();
            let node = &nodes[idx];
            (
                node.descriptor.name().to_string(),
                Arc::clone(&node.service),
                node.state,
            )
        };

        let mut failure = None;
        if state.is_stoppable() {
            let ctx = ServiceContext::new(name.clone(), Arc::clone(&self.broker));
            match run_hook(&service, LifecyclePhase::Stop, &ctx).await {
                Ok(()) => {
                    log_service_event!(info, name, LifecyclePhase::Stop, "Hook completed");
                    SERVICE_TRANSITIONS
                        .with_label_values(&[LifecyclePhase::Stop.as_str(), "ok"])
                        .inc();
                    self.nodes.write()[idx].state = ServiceState::Stopped;
                }
                Err(err) => {
                    log_service_event!(error, name, LifecyclePhase::Stop, "Hook failed", reason = %err);
                    SERVICE_TRANSITIONS
                        .with_label_values(&[LifecyclePhase::Stop.as_str(), "failed"])
                        .inc();
                    let stop_failure = ServiceFailure {
                        service: name.clone(),
                        phase: LifecyclePhase::Stop,
                        cause: FailureCause::Hook { reason: err.reason },
                    };
                    self.record_failure(idx, stop_failure.clone());
                    failure = Some(stop_failure);
                }
            }
        }

        let released = self.broker.unsubscribe_all(&SubscriberId::new(name.clone()));
        if released > 0 {
            info!(service = %name, subscriptions = released, "Released leftover subscriptions");
        }
        failure
    }

    fn record_failure(&self, idx: usize, failure: ServiceFailure) {
        let mut nodes = self.nodes.write();
        nodes[idx].state = ServiceState::Failed;
        nodes[idx].failure = Some(failure);
    }

    fn update_started_gauge(&self) {
        let started = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.state == ServiceState::Started)
            .count();
        SERVICES_STARTED.set(started as f64);
    }
}

/// Run one hook. A panic inside the hook is reported as a hook failure.
async fn run_hook(
    service: &Arc<dyn EngineService>,
    phase: LifecyclePhase,
    ctx: &ServiceContext,
) -> Result<(), HookError> {
    let hook = async {
        match phase {
            LifecyclePhase::Register => service.on_register(ctx).await,
            LifecyclePhase::PostRegister => service.on_post_register(ctx).await,
            LifecyclePhase::Start => service.on_start(ctx).await,
            LifecyclePhase::Stop => service.on_stop(ctx).await,
        }
    };

    AssertUnwindSafe(hook).catch_unwind().await.unwrap_or_else(|panic| {
        Err(HookError::new(format!(
            "panicked: {}",
            panic_message(&*panic)
        )))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
