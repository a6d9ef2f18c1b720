//! # Message Envelope
//!
//! The universal wrapper for every message exchanged on the engine bus.
//!
//! ## Wire Shape
//!
//! ```json
//! {
//!   "header": {
//!     "id": "5b0e...",
//!     "version": "3.2",
//!     "messageType": "Publish",
//!     "messageDescription": { "topic": "PropertyManager", "action": "SetProperty" }
//!   },
//!   "payload": { "name": "locale", "value": "en-US" }
//! }
//! ```
//!
//! - **Routing**: `(topic, action)` is the routing key. `version` never takes
//!   part in routing, it only selects the payload schema.
//! - **Correlation**: a `Reply` carries the request id, either as its own `id`
//!   or as `messageDescription.replyToId`.

use crate::errors::EnvelopeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Correlation identifier of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Generate a fresh identifier (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EnvelopeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of message carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Fire-and-forget event or command.
    Publish,
    /// Expects exactly one `Reply` with the same id.
    Request,
    /// Terminal response correlated by id.
    Reply,
}

impl MessageType {
    /// Wire name of the message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "Publish",
            Self::Request => "Request",
            Self::Reply => "Reply",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key of a message: `(topic, action)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub topic: String,
    pub action: String,
}

impl RouteKey {
    pub fn new(topic: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            action: action.into(),
        }
    }

    /// Both parts must be non-empty to be routable.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        !self.topic.trim().is_empty() && !self.action.trim().is_empty()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.action)
    }
}

/// Semantic description of a message (its routing key plus reply linkage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDescription {
    pub topic: String,
    pub action: String,
    /// Id of the request this message answers. Only meaningful on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<EnvelopeId>,
}

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Generated by the sender unless the message is a reply.
    #[serde(default)]
    pub id: EnvelopeId,
    /// Payload schema version. Used for validation only.
    pub version: String,
    pub message_type: MessageType,
    pub message_description: MessageDescription,
}

/// The full message unit exchanged on the bus.
///
/// The broker never inspects `payload`; it is validated against the schema
/// registered for `(topic, action, version)` when validation is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub header: MessageHeader,
    #[serde(default)]
    pub payload: Value,
}

impl MessageEnvelope {
    fn build(
        message_type: MessageType,
        topic: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            header: MessageHeader {
                id: EnvelopeId::generate(),
                version: version.into(),
                message_type,
                message_description: MessageDescription {
                    topic: topic.into(),
                    action: action.into(),
                    reply_to_id: None,
                },
            },
            payload,
        }
    }

    /// Build a fire-and-forget envelope with a fresh id.
    pub fn publish(
        topic: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::build(MessageType::Publish, topic, action, version, payload)
    }

    /// Build a request envelope with a fresh id.
    pub fn request(
        topic: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::build(MessageType::Request, topic, action, version, payload)
    }

    /// Build the reply to `self`, echoing its id.
    pub fn reply(&self, payload: Value) -> Self {
        let mut reply = Self::build(
            MessageType::Reply,
            self.topic(),
            self.action(),
            self.version(),
            payload,
        );
        reply.header.id = self.header.id.clone();
        reply.header.message_description.reply_to_id = Some(self.header.id.clone());
        reply
    }

    /// Replace the envelope id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EnvelopeId>) -> Self {
        self.header.id = id.into();
        self
    }

    /// Replace the payload schema version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.header.version = version.into();
        self
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.header.id
    }

    pub fn topic(&self) -> &str {
        &self.header.message_description.topic
    }

    pub fn action(&self) -> &str {
        &self.header.message_description.action
    }

    pub fn version(&self) -> &str {
        &self.header.version
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(self.topic(), self.action())
    }

    /// Id used to match this envelope against a pending request.
    ///
    /// `replyToId` wins when present, otherwise the envelope id is used.
    pub fn correlation_id(&self) -> &EnvelopeId {
        self.header
            .message_description
            .reply_to_id
            .as_ref()
            .unwrap_or(&self.header.id)
    }

    /// Serialize to the external JSON representation.
    pub fn to_json_string(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Parse the external JSON representation.
    pub fn from_json_str(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Convert an already-parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = MessageEnvelope::publish(
            "PropertyManager",
            "SetProperty",
            "3.2",
            json!({"name": "locale", "value": "en-US"}),
        )
        .with_id("abc");

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["header"]["id"], "abc");
        assert_eq!(value["header"]["version"], "3.2");
        assert_eq!(value["header"]["messageType"], "Publish");
        assert_eq!(value["header"]["messageDescription"]["topic"], "PropertyManager");
        assert_eq!(value["header"]["messageDescription"]["action"], "SetProperty");
        assert!(value["header"]["messageDescription"].get("replyToId").is_none());
        assert_eq!(value["payload"]["value"], "en-US");
    }

    #[test]
    fn test_parse_tolerates_missing_id_and_payload() {
        let raw = r#"{"header":{"version":"1.0","messageType":"Request",
            "messageDescription":{"topic":"Network","action":"GetStatus"}}}"#;
        let envelope = MessageEnvelope::from_json_str(raw).unwrap();

        assert!(!envelope.id().as_str().is_empty());
        assert_eq!(envelope.message_type(), MessageType::Request);
        assert_eq!(envelope.payload(), &Value::Null);
    }

    #[test]
    fn test_malformed_document() {
        let result = MessageEnvelope::from_json_str("{}");
        assert!(matches!(result, Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let request = MessageEnvelope::request("Network", "GetStatus", "1.0", Value::Null);
        let reply = request.reply(json!({"status": "CONNECTED"}));

        assert_eq!(reply.message_type(), MessageType::Reply);
        assert_eq!(reply.id(), request.id());
        assert_eq!(reply.correlation_id(), request.id());
        assert_eq!(reply.route_key(), request.route_key());
    }

    #[test]
    fn test_correlation_prefers_reply_to_id() {
        let mut reply = MessageEnvelope::publish("Network", "GetStatus", "1.0", Value::Null)
            .with_id("own-id");
        reply.header.message_type = MessageType::Reply;
        reply.header.message_description.reply_to_id = Some(EnvelopeId::from("request-id"));

        assert_eq!(reply.correlation_id().as_str(), "request-id");
    }

    #[test]
    fn test_route_key_routable() {
        assert!(RouteKey::new("Alerts", "AlertStateChanged").is_routable());
        assert!(!RouteKey::new("", "AlertStateChanged").is_routable());
        assert!(!RouteKey::new("Alerts", "  ").is_routable());
    }
}
