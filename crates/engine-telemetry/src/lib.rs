//! # Engine Telemetry
//!
//! Logging and metrics for the engine bus.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with env filter, pretty or JSON output
//! - **Metrics**: Prometheus counters and gauges for the broker, the
//!   lifecycle manager and the network collaborator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use engine_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let guard = init_telemetry(&config).expect("Failed to init telemetry");
//!
//!     // Application code here
//!     println!("{}", guard.metrics().unwrap().gather_text().unwrap());
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ENGINE_SERVICE_NAME` | `engine` | Service name in logs |
//! | `ENGINE_LOG_LEVEL` | `info` | Log level filter |
//! | `ENGINE_JSON_LOGS` | `false` | JSON formatted logs |
//! | `ENGINE_METRICS` | `true` | Register Prometheus metrics |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, MetricsHandle, BUS_DISPATCH_DURATION,
    BUS_MESSAGES_DELIVERED, BUS_MESSAGES_PUBLISHED, BUS_PENDING_REQUESTS, BUS_REQUEST_OUTCOMES,
    BUS_SCHEMA_FAILURES, BUS_STALE_REPLIES, NETWORK_STATUS_CHANGED, SERVICES_STARTED,
    SERVICE_TRANSITIONS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first, logging may report on them
    let metrics = if config.metrics_enabled {
        Some(register_metrics()?)
    } else {
        None
    };

    init_logging(config)?;

    Ok(TelemetryGuard { metrics })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    metrics: Option<MetricsHandle>,
}

impl TelemetryGuard {
    /// Metrics handle, when metrics are enabled.
    pub fn metrics(&self) -> Option<&MetricsHandle> {
        self.metrics.as_ref()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
