//! # Engine Bus - In-Process Message Broker
//!
//! Every engine service talks to every other service through this broker.
//! Services never call each other directly.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────┐
//! │  Service A   │                    │  Service B   │
//! │              │    publish()       │              │
//! │              │ ──────┐            │              │
//! └──────────────┘       │            └──────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐          │
//!                  │    Broker    │          │
//!                  │ (topic,action)│ ─────────┘
//!                  └──────────────┘  subscribe()
//! ```
//!
//! ## Guarantees
//!
//! - **Routing:** by `(topic, action)` only; the envelope version selects a
//!   schema, never a route
//! - **Ordering:** per key, all handlers observe envelopes in the same order
//! - **Requests:** each resolves exactly once, to its reply or to `Timeout`
//! - **Stale replies:** dropped and logged, never delivered to subscribers

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod broker;
pub mod error;
pub mod pending;
pub mod subscription;

// Re-export main types
pub use broker::{BrokerConfig, BrokerStats, Dispatch, MessageBroker};
pub use error::BrokerError;
pub use pending::{PendingReply, PendingRequestStore, PendingStats, ReplyOutcome, RequestOutcome};
pub use subscription::{
    DynHandler, EnvelopeStream, MessageHandler, SubscriberId, SubscriptionHandle,
};

use std::time::Duration;

/// Deadline for requests issued without an explicit timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
