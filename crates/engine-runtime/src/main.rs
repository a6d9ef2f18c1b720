//! # Engine Runtime
//!
//! Boots the engine and keeps it running until Ctrl+C.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (`ENGINE_CONFIG` TOML file if set, then environment)
//! 2. Initialize logging and metrics
//! 3. Build the broker and register message schemas
//! 4. Submit and activate services in dependency order
//! 5. Wait for Ctrl+C, then deactivate in reverse order

use anyhow::{Context, Result};
use engine_runtime::{Engine, RuntimeConfig};
use engine_telemetry::init_telemetry;
use tracing::{error, info, warn};

fn load_config() -> Result<RuntimeConfig> {
    match std::env::var("ENGINE_CONFIG") {
        Ok(path) => RuntimeConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {path}")),
        Err(_) => {
            let config = RuntimeConfig::from_env().context("Invalid environment configuration")?;
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let telemetry = init_telemetry(&config.telemetry).context("Failed to initialize telemetry")?;

    info!("===========================================");
    info!("  Engine Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  Request timeout: {}ms, validation: {:?}",
        config.broker.request_timeout_ms, config.broker.validation
    );
    info!("===========================================");

    let engine = Engine::new(&config)?;
    match engine.start().await {
        Ok(report) => info!(order = ?report.order, "All services started"),
        // Partial activation still serves the services that did start
        Err(err) => warn!(error = %err, "Engine started degraded"),
    }

    info!("Engine is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    if let Err(err) = engine.shutdown().await {
        error!(error = %err, "Shutdown completed with errors");
    }

    if let Some(metrics) = telemetry.metrics() {
        match metrics.gather_text() {
            Ok(text) => info!(bytes = text.len(), "Final metrics snapshot gathered"),
            Err(err) => warn!(error = %err, "Failed to gather metrics"),
        }
    }

    Ok(())
}
