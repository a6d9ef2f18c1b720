//! # Broker Errors
//!
//! Returned synchronously to the caller of `subscribe`, `publish`, `request`
//! and `reply`. A stale reply is not an error (see `ReplyOutcome::Stale`).

use engine_types::{EnvelopeId, MessageType, SchemaError};
use thiserror::Error;

/// Errors from broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Topic or action is empty.
    #[error("Invalid routing key: topic={topic:?} action={action:?}")]
    InvalidTopic { topic: String, action: String },

    /// The envelope failed schema validation.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A request with this id is already waiting for a reply.
    #[error("Request id {id} is already in flight")]
    DuplicateRequestId { id: EnvelopeId },

    /// The envelope has the wrong message type for this operation.
    #[error("Envelope {id} is a {found}, expected {expected}")]
    UnexpectedMessageType {
        id: EnvelopeId,
        expected: MessageType,
        found: MessageType,
    },

    /// Requests need a Tokio runtime to drive their deadline.
    #[error("Request issued outside a Tokio runtime; no timer available for its deadline")]
    NoTimerRuntime,
}
