//! # Property Manager
//!
//! String-valued engine properties behind the broker.
//!
//! | Topic/Action | Type | Payload |
//! |--------------|------|---------|
//! | `PropertyManager/SetProperty` | Publish | `{ name, value }` |
//! | `PropertyManager/GetProperty` | Request | `{ name }`; reply `{ name, value }` |
//! | `PropertyManager/PropertyChanged` | Publish | `{ name, value }` |
//! | `PropertyManager/PropertyStateChanged` | Publish | `{ name, value, state }` |

use crate::lifecycle::{EngineService, HookError, ServiceContext};
use async_trait::async_trait;
use engine_bus::{MessageBroker, SubscriptionHandle};
use engine_types::{FieldKind, MessageEnvelope, PayloadSchema, SchemaError, SchemaRegistry};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const PROPERTY_TOPIC: &str = "PropertyManager";
pub const SET_PROPERTY_ACTION: &str = "SetProperty";
pub const GET_PROPERTY_ACTION: &str = "GetProperty";
pub const PROPERTY_CHANGED_ACTION: &str = "PropertyChanged";
pub const PROPERTY_STATE_CHANGED_ACTION: &str = "PropertyStateChanged";
pub const PROPERTY_MESSAGE_VERSION: &str = "3.2";

/// Result of a `SetProperty`.
pub const PROPERTY_STATES: [&str; 2] = ["SUCCEEDED", "FAILED"];

/// Register the property message schemas and the `PropertyState` enum table.
pub fn register_property_schemas(schemas: &SchemaRegistry) -> Result<(), SchemaError> {
    schemas.register_enum("PropertyState", PROPERTY_STATES)?;

    let name_value = PayloadSchema::new()
        .required("name", FieldKind::String)
        .required("value", FieldKind::String);

    schemas.register(
        PROPERTY_TOPIC,
        SET_PROPERTY_ACTION,
        PROPERTY_MESSAGE_VERSION,
        name_value.clone(),
    )?;
    schemas.register(
        PROPERTY_TOPIC,
        PROPERTY_CHANGED_ACTION,
        PROPERTY_MESSAGE_VERSION,
        name_value,
    )?;
    schemas.register(
        PROPERTY_TOPIC,
        GET_PROPERTY_ACTION,
        PROPERTY_MESSAGE_VERSION,
        PayloadSchema::new()
            .required("name", FieldKind::String)
            .optional("value", FieldKind::String),
    )?;
    schemas.register(
        PROPERTY_TOPIC,
        PROPERTY_STATE_CHANGED_ACTION,
        PROPERTY_MESSAGE_VERSION,
        PayloadSchema::new()
            .required("name", FieldKind::String)
            .required("value", FieldKind::String)
            .required("state", FieldKind::NamedEnum("PropertyState".into())),
    )?;
    Ok(())
}

pub fn set_property_envelope(name: &str, value: &str) -> MessageEnvelope {
    MessageEnvelope::publish(
        PROPERTY_TOPIC,
        SET_PROPERTY_ACTION,
        PROPERTY_MESSAGE_VERSION,
        json!({ "name": name, "value": value }),
    )
}

pub fn get_property_envelope(name: &str) -> MessageEnvelope {
    MessageEnvelope::request(
        PROPERTY_TOPIC,
        GET_PROPERTY_ACTION,
        PROPERTY_MESSAGE_VERSION,
        json!({ "name": name }),
    )
}

fn string_field<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload.get(field).and_then(Value::as_str)
}

/// In-memory property store.
///
/// Properties not seeded at construction are read-only unknowns: setting one
/// fails with a `FAILED` state notification.
pub struct PropertyManagerService {
    properties: Arc<RwLock<BTreeMap<String, String>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl PropertyManagerService {
    pub const NAME: &'static str = "PropertyManager";

    pub fn new<I, K, V>(defaults: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let properties = defaults
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            properties: Arc::new(RwLock::new(properties)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.properties.read().get(name).cloned()
    }
}

fn handle_set(
    properties: &RwLock<BTreeMap<String, String>>,
    broker: &MessageBroker,
    envelope: &MessageEnvelope,
) {
    let payload = envelope.payload();
    let (Some(name), Some(value)) = (string_field(payload, "name"), string_field(payload, "value"))
    else {
        warn!(id = %envelope.id(), "SetProperty without name/value");
        return;
    };

    let changed = {
        let mut properties = properties.write();
        match properties.get_mut(name) {
            Some(current) if current == value => Some(false),
            Some(current) => {
                *current = value.to_string();
                Some(true)
            }
            None => None,
        }
    };

    let state = if changed.is_some() { "SUCCEEDED" } else { "FAILED" };
    info!(name, value, state, "SetProperty");

    let notifications = [
        changed.filter(|c| *c).map(|_| {
            MessageEnvelope::publish(
                PROPERTY_TOPIC,
                PROPERTY_CHANGED_ACTION,
                PROPERTY_MESSAGE_VERSION,
                json!({ "name": name, "value": value }),
            )
        }),
        Some(MessageEnvelope::publish(
            PROPERTY_TOPIC,
            PROPERTY_STATE_CHANGED_ACTION,
            PROPERTY_MESSAGE_VERSION,
            json!({ "name": name, "value": value, "state": state }),
        )),
    ];
    for notification in notifications.into_iter().flatten() {
        if let Err(err) = broker.publish(notification) {
            warn!(name, error = %err, "Failed to publish property notification");
        }
    }
}

fn handle_get(
    properties: &RwLock<BTreeMap<String, String>>,
    broker: &MessageBroker,
    request: &MessageEnvelope,
) {
    let Some(name) = string_field(request.payload(), "name") else {
        warn!(id = %request.id(), "GetProperty without name");
        return;
    };
    let value = properties.read().get(name).cloned();
    debug!(name, found = value.is_some(), "GetProperty");

    let reply = request.reply(json!({ "name": name, "value": value }));
    if let Err(err) = broker.reply(reply) {
        warn!(id = %request.id(), error = %err, "Failed to answer GetProperty");
    }
}

#[async_trait]
impl EngineService for PropertyManagerService {
    async fn on_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let broker: Weak<MessageBroker> = Arc::downgrade(ctx.broker());
        let properties = Arc::clone(&self.properties);
        let on_set = ctx.broker().subscribe_fn(
            PROPERTY_TOPIC,
            SET_PROPERTY_ACTION,
            ctx.subscriber_id(),
            move |envelope| {
                if let Some(broker) = broker.upgrade() {
                    handle_set(&properties, &broker, envelope);
                }
            },
        )?;

        let broker: Weak<MessageBroker> = Arc::downgrade(ctx.broker());
        let properties = Arc::clone(&self.properties);
        let on_get = ctx.broker().subscribe_fn(
            PROPERTY_TOPIC,
            GET_PROPERTY_ACTION,
            ctx.subscriber_id(),
            move |request| {
                if let Some(broker) = broker.upgrade() {
                    handle_get(&properties, &broker, request);
                }
            },
        )?;

        self.subscriptions.lock().extend([on_set, on_get]);
        Ok(())
    }

    async fn on_stop(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let handles: Vec<SubscriptionHandle> = self.subscriptions.lock().drain(..).collect();
        for handle in &handles {
            ctx.broker().unsubscribe(handle);
        }
        Ok(())
    }
}
