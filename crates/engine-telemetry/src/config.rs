//! Telemetry configuration from environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or full EnvFilter directive
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Whether to register Prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "engine".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ENGINE_SERVICE_NAME`: Service name (default: engine)
    /// - `ENGINE_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `ENGINE_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `ENGINE_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `ENGINE_METRICS`: Register Prometheus metrics (default: true)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that are set in the environment.
    pub fn apply_env(&mut self) {
        if let Ok(name) = env::var("ENGINE_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Ok(level) = env::var("ENGINE_LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            self.log_level = level;
        }
        if let Ok(v) = env::var("ENGINE_CONSOLE_OUTPUT") {
            self.console_output = v.to_lowercase() != "false" && v != "0";
        }
        if let Ok(v) = env::var("ENGINE_JSON_LOGS") {
            self.json_logs = v.to_lowercase() == "true" || v == "1";
        }
        if let Ok(v) = env::var("ENGINE_METRICS") {
            self.metrics_enabled = v.to_lowercase() != "false" && v != "0";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.console_output);
        assert!(!config.json_logs);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"json_logs": true}"#).unwrap();
        assert!(config.json_logs);
        assert_eq!(config.service_name, "engine");
    }
}
