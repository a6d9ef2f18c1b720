//! # Network Info
//!
//! Multicasts network status changes to observers, and a service that feeds
//! it from the broker.
//!
//! Observers are added and removed under a lock; notification runs over a
//! snapshot, so an observer may add or remove observers (itself included)
//! from inside a callback.
//!
//! ## Messages
//!
//! | Topic/Action | Type | Payload |
//! |--------------|------|---------|
//! | `Network/NetworkStatusChanged` | Publish | `{ networkStatus, wifiSignalStrength }` |
//! | `Network/GetNetworkInfo` | Request | `{}`; reply `{ networkStatus, wifiSignalStrength }` |

use crate::lifecycle::{EngineService, HookError, ServiceContext};
use async_trait::async_trait;
use engine_bus::{MessageBroker, SubscriptionHandle};
use engine_telemetry::NETWORK_STATUS_CHANGED;
use engine_types::{FieldKind, MessageEnvelope, PayloadSchema, SchemaError, SchemaRegistry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const NETWORK_TOPIC: &str = "Network";
pub const STATUS_CHANGED_ACTION: &str = "NetworkStatusChanged";
pub const GET_NETWORK_INFO_ACTION: &str = "GetNetworkInfo";
pub const NETWORK_MESSAGE_VERSION: &str = "1.0";

/// Connectivity status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkStatus {
    #[default]
    Unknown,
    Disconnected,
    Disconnecting,
    Connected,
    Connecting,
}

impl NetworkStatus {
    pub const ALL: [NetworkStatus; 5] = [
        Self::Unknown,
        Self::Disconnected,
        Self::Disconnecting,
        Self::Connected,
        Self::Connecting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Disconnected => "DISCONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Connected => "CONNECTED",
            Self::Connecting => "CONNECTING",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkStatus {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| NetworkError::UnknownStatus(s.to_string()))
    }
}

/// Progress of a network interface switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkInterfaceChangeStatus {
    Begin,
    Change,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Proxy header list is empty")]
    EmptyProxyHeaders,

    #[error("Unknown network status: {0}")]
    UnknownStatus(String),

    #[error("Malformed network payload: {0}")]
    MalformedPayload(String),
}

/// Receives network notifications.
pub trait NetworkInfoObserver: Send + Sync {
    fn on_network_info_changed(&self, status: NetworkStatus, wifi_signal_strength: i32);

    fn on_network_interface_change_status_changed(
        &self,
        _network_interface: &str,
        _status: NetworkInterfaceChangeStatus,
    ) {
    }

    fn on_network_proxy_headers_available(&self, _headers: &[String]) {}
}

/// Current status plus the observers to tell about changes.
pub struct NetworkInfoProvider {
    observers: RwLock<Vec<Arc<dyn NetworkInfoObserver>>>,
    current: RwLock<(NetworkStatus, i32)>,
}

impl NetworkInfoProvider {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            current: RwLock::new((NetworkStatus::Unknown, 0)),
        }
    }

    /// Add an observer. Returns `false` if it was already registered.
    pub fn add_observer(&self, observer: Arc<dyn NetworkInfoObserver>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| same_observer(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn NetworkInfoObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !same_observer(o, observer));
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.current.read().0
    }

    pub fn wifi_signal_strength(&self) -> i32 {
        self.current.read().1
    }

    /// Record a status change and notify every observer.
    pub fn network_info_changed(&self, status: NetworkStatus, wifi_signal_strength: i32) {
        NETWORK_STATUS_CHANGED
            .with_label_values(&[status.as_str()])
            .inc();
        *self.current.write() = (status, wifi_signal_strength);
        info!(status = %status, wifi_signal_strength, "Network info changed");

        for observer in self.snapshot() {
            observer.on_network_info_changed(status, wifi_signal_strength);
        }
    }

    /// Announce an interface switch: `Begin`, `Change`, then `Completed`.
    pub fn set_network_interface(&self, network_interface: &str) {
        info!(network_interface, "Network interface change");
        let observers = self.snapshot();
        for status in [
            NetworkInterfaceChangeStatus::Begin,
            NetworkInterfaceChangeStatus::Change,
            NetworkInterfaceChangeStatus::Completed,
        ] {
            for observer in &observers {
                observer.on_network_interface_change_status_changed(network_interface, status);
            }
        }
    }

    /// Split newline-separated proxy headers and hand them to observers.
    pub fn set_network_http_proxy_header(&self, headers: &str) -> Result<Vec<String>, NetworkError> {
        let headers: Vec<String> = headers
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if headers.is_empty() {
            return Err(NetworkError::EmptyProxyHeaders);
        }

        debug!(count = headers.len(), "Proxy headers available");
        for observer in self.snapshot() {
            observer.on_network_proxy_headers_available(&headers);
        }
        Ok(headers)
    }

    fn snapshot(&self) -> Vec<Arc<dyn NetworkInfoObserver>> {
        self.observers.read().clone()
    }
}

impl Default for NetworkInfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn same_observer(a: &Arc<dyn NetworkInfoObserver>, b: &Arc<dyn NetworkInfoObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Register the network message schemas and the `NetworkStatus` enum table.
pub fn register_network_schemas(schemas: &SchemaRegistry) -> Result<(), SchemaError> {
    schemas.register_enum(
        "NetworkStatus",
        NetworkStatus::ALL.iter().map(NetworkStatus::as_str),
    )?;

    let status_payload = PayloadSchema::new()
        .required("networkStatus", FieldKind::NamedEnum("NetworkStatus".into()))
        .optional("wifiSignalStrength", FieldKind::Integer);

    schemas.register(
        NETWORK_TOPIC,
        STATUS_CHANGED_ACTION,
        NETWORK_MESSAGE_VERSION,
        status_payload,
    )?;
    schemas.register(
        NETWORK_TOPIC,
        GET_NETWORK_INFO_ACTION,
        NETWORK_MESSAGE_VERSION,
        PayloadSchema::new(),
    )?;
    Ok(())
}

/// Envelope announcing a status change.
pub fn status_changed_envelope(status: NetworkStatus, wifi_signal_strength: i32) -> MessageEnvelope {
    MessageEnvelope::publish(
        NETWORK_TOPIC,
        STATUS_CHANGED_ACTION,
        NETWORK_MESSAGE_VERSION,
        json!({
            "networkStatus": status,
            "wifiSignalStrength": wifi_signal_strength,
        }),
    )
}

fn parse_status_payload(envelope: &MessageEnvelope) -> Result<(NetworkStatus, i32), NetworkError> {
    let payload = envelope.payload();
    let status = payload
        .get("networkStatus")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NetworkError::MalformedPayload("missing networkStatus".to_string()))?
        .parse()?;
    let signal = payload
        .get("wifiSignalStrength")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let signal = i32::try_from(signal)
        .map_err(|_| NetworkError::MalformedPayload(format!("wifiSignalStrength {signal}")))?;
    Ok((status, signal))
}

/// Engine service exposing a `NetworkInfoProvider` on the broker.
pub struct NetworkInfoService {
    provider: Arc<NetworkInfoProvider>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl NetworkInfoService {
    pub const NAME: &'static str = "NetworkInfo";

    pub fn new(provider: Arc<NetworkInfoProvider>) -> Self {
        Self {
            provider,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn provider(&self) -> &Arc<NetworkInfoProvider> {
        &self.provider
    }
}

#[async_trait]
impl EngineService for NetworkInfoService {
    async fn on_register(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let provider = Arc::clone(&self.provider);
        let on_status = ctx.broker().subscribe_fn(
            NETWORK_TOPIC,
            STATUS_CHANGED_ACTION,
            ctx.subscriber_id(),
            move |envelope| match parse_status_payload(envelope) {
                Ok((status, signal)) => provider.network_info_changed(status, signal),
                Err(err) => warn!(id = %envelope.id(), error = %err, "Ignoring network status"),
            },
        )?;

        let provider = Arc::clone(&self.provider);
        let broker: Weak<MessageBroker> = Arc::downgrade(ctx.broker());
        let on_query = ctx.broker().subscribe_fn(
            NETWORK_TOPIC,
            GET_NETWORK_INFO_ACTION,
            ctx.subscriber_id(),
            move |request| {
                let Some(broker) = broker.upgrade() else {
                    return;
                };
                let reply = request.reply(json!({
                    "networkStatus": provider.network_status(),
                    "wifiSignalStrength": provider.wifi_signal_strength(),
                }));
                if let Err(err) = broker.reply(reply) {
                    warn!(id = %request.id(), error = %err, "Failed to answer network query");
                }
            },
        )?;

        self.subscriptions.lock().extend([on_status, on_query]);
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
