//! # Engine Types Crate
//!
//! Types shared by the message broker and the service lifecycle manager.
//!
//! ## Contents
//!
//! - **Envelope**: `MessageEnvelope`, the single wrapper for every message on
//!   the bus, with its header, routing key and correlation id.
//! - **Schema Registry**: payload shape checks keyed by
//!   `(topic, action, version)`, replacing one generated type per message.
//! - **Service Descriptor**: name, version and declared dependencies of an
//!   engine service.

pub mod descriptor;
pub mod envelope;
pub mod errors;
pub mod schema;

pub use descriptor::ServiceDescriptor;
pub use envelope::{
    EnvelopeId, MessageDescription, MessageEnvelope, MessageHeader, MessageType, RouteKey,
};
pub use errors::{DescriptorError, EnvelopeError, SchemaError};
pub use schema::{FieldKind, FieldSpec, PayloadSchema, SchemaKey, SchemaRegistry, ValidationMode};
