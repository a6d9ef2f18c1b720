//! # Engine Runtime Library
//!
//! Hosts engine services on top of the message broker. The `engine-runtime`
//! binary (`main.rs`) is a thin wrapper around [`Engine`].
//!
//! ## Modules
//!
//! - `lifecycle` - dependency-ordered activation and reverse-order shutdown
//! - `config` - `RuntimeConfig` from defaults, TOML and environment
//! - `network` - network status provider and its broker-facing service
//! - `services` - property manager and a client of it
//! - `engine` - everything wired together

#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod network;
pub mod services;

pub use config::{BrokerSettings, ConfigError, RuntimeConfig};
pub use engine::{Engine, EngineError};
pub use lifecycle::{
    ActivationReport, EngineService, FailureCause, HookError, LifecycleError, LifecycleManager,
    LifecyclePhase, ManagerPhase, ServiceContext, ServiceFailure, ServiceState,
};
pub use network::{
    NetworkInfoObserver, NetworkInfoProvider, NetworkInfoService, NetworkInterfaceChangeStatus,
    NetworkStatus,
};
