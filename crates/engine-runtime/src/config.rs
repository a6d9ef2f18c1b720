//! # Runtime Configuration
//!
//! Defaults, then an optional TOML file, then environment overrides.
//!
//! ```toml
//! [broker]
//! request_timeout_ms = 10000
//! validation = "strict"
//!
//! [telemetry]
//! log_level = "debug"
//! json_logs = true
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `ENGINE_REQUEST_TIMEOUT_MS` | `broker.request_timeout_ms` |
//! | `ENGINE_VALIDATION_MODE` | `broker.validation` (`strict` / `permissive`) |
//! | `ENGINE_LOG_LEVEL`, `ENGINE_JSON_LOGS`, ... | see `TelemetryConfig` |

use engine_bus::{BrokerConfig, DEFAULT_REQUEST_TIMEOUT};
use engine_telemetry::TelemetryConfig;
use engine_types::{SchemaRegistry, ValidationMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `broker.request_timeout_ms` (one day).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {error}")]
    Io { path: String, error: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Default request deadline in milliseconds.
    pub request_timeout_ms: u64,
    /// Validate every envelope (`strict`) or only on request (`permissive`).
    pub validation: ValidationMode,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            validation: ValidationMode::default(),
        }
    }
}

impl BrokerSettings {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Empty schema registry in the configured validation mode.
    pub fn schema_registry(&self) -> SchemaRegistry {
        SchemaRegistry::new(self.validation)
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub broker: BrokerSettings,
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a TOML file, then apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields that are set in the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.telemetry.apply_env();
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply broker overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ENGINE_REQUEST_TIMEOUT_MS") {
            self.broker.request_timeout_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: "ENGINE_REQUEST_TIMEOUT_MS".to_string(),
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("ENGINE_VALIDATION_MODE") {
            self.broker.validation = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "ENGINE_VALIDATION_MODE".to_string(),
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.broker.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "broker.request_timeout_ms must be at most {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }
        if self.telemetry.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "telemetry.log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
