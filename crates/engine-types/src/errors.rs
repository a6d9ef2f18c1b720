//! # Error Types
//!
//! Errors raised by the envelope, schema registry and descriptor layers.

use thiserror::Error;

/// Errors from reading or writing the external envelope representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The document does not have the envelope shape.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Errors from the schema registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// A different schema is already registered for this message type.
    #[error("Schema conflict for {topic}/{action} v{version}")]
    Conflict {
        topic: String,
        action: String,
        version: String,
    },

    /// A different value table is already registered under this enum name.
    #[error("Enum conflict: {name} is already registered with different values")]
    EnumConflict { name: String },

    /// The payload does not match the registered schema.
    #[error("Schema validation failed for {topic}/{action} v{version}: {detail}")]
    Validation {
        topic: String,
        action: String,
        version: String,
        detail: String,
    },
}

/// Errors from descriptor validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The service lists itself as a dependency.
    #[error("Service {service} depends on itself")]
    SelfDependency { service: String },

    /// The service name is empty.
    #[error("Service name must not be empty")]
    EmptyName,
}
