//! Lifecycle errors.

use super::LifecyclePhase;
use engine_types::DescriptorError;
use std::fmt;
use thiserror::Error;

/// Why a service did not reach the next state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The service's own hook failed.
    Hook { reason: String },
    /// A dependency had not reached the state this phase requires.
    DependencyFailed { dependency: String },
}

/// One service that failed, and in which phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub phase: LifecyclePhase,
    pub cause: FailureCause,
}

impl ServiceFailure {
    /// Whether the service's own hook failed (as opposed to a dependency).
    pub fn is_hook_failure(&self) -> bool {
        matches!(self.cause, FailureCause::Hook { .. })
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            FailureCause::Hook { reason } => {
                write!(f, "[{}] {} hook failed: {}", self.service, self.phase, reason)
            }
            FailureCause::DependencyFailed { dependency } => write!(
                f,
                "[{}] skipped {}: dependency {} is not ready",
                self.service, self.phase, dependency
            ),
        }
    }
}

fn summarize(failures: &[ServiceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Activation or deactivation has begun.
    #[error("Activation is in progress")]
    ActivationInProgress,

    /// `activate` already ran.
    #[error("Services have already been activated")]
    AlreadyActivated,

    /// `deactivate` before any successful graph resolution.
    #[error("Services have not been activated")]
    NotActivated,

    #[error("Service {name} was already submitted")]
    DuplicateService { name: String },

    #[error(transparent)]
    InvalidDescriptor(#[from] DescriptorError),

    #[error("Dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Service {service} depends on {missing}, which was never submitted")]
    UnresolvedDependency { service: String, missing: String },

    /// Every service that did not reach `Started`.
    #[error("Activation failed for {} service(s): {}", .failures.len(), summarize(.failures))]
    Activation { failures: Vec<ServiceFailure> },

    /// Every `on_stop` that failed. All services were still attempted.
    #[error("Deactivation failed for {} service(s): {}", .failures.len(), summarize(.failures))]
    Deactivation { failures: Vec<ServiceFailure> },
}

impl LifecycleError {
    /// Failures carried by an aggregate error.
    pub fn failures(&self) -> &[ServiceFailure] {
        match self {
            Self::Activation { failures } | Self::Deactivation { failures } => failures,
            _ => &[],
        }
    }
}
