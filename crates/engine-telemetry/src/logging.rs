//! Structured logging setup.
//!
//! Logs carry consistent fields so they can be filtered per service:
//! - `level`: Log level (trace, debug, info, warn, error)
//! - `service`: Engine service name (for lifecycle and service logs)
//! - `topic` / `action` / `id`: Envelope routing fields (for bus logs)
//! - Additional context fields

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Install the global `tracing` subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    if !config.console_output {
        return tracing_subscriber::registry()
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()));
    }

    if config.json_logs {
        // JSON output for containers/production
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        // Pretty output for development
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Logging initialized"
    );

    Ok(())
}

/// Helper to create structured log entries with consistent formatting.
#[macro_export]
macro_rules! log_event {
    // Info level with service
    (info, $service:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::info!(
            service = $service,
            $($($field)*,)?
            $msg
        )
    };

    // Warn level with service
    (warn, $service:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::warn!(
            service = $service,
            $($($field)*,)?
            $msg
        )
    };

    // Error level with service
    (error, $service:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::error!(
            service = $service,
            $($($field)*,)?
            $msg
        )
    };

    // Debug level with service
    (debug, $service:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::debug!(
            service = $service,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a lifecycle transition with standard fields.
#[macro_export]
macro_rules! log_service_event {
    ($level:ident, $service:expr, $phase:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            service = %$service,
            phase = %$phase,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an envelope-related event with standard fields.
#[macro_export]
macro_rules! log_envelope_event {
    ($level:ident, $envelope:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            topic = %$envelope.topic(),
            action = %$envelope.action(),
            id = %$envelope.id(),
            message_type = %$envelope.message_type(),
            $($($field)*,)?
            $msg
        )
    };
}
