//! # Message Broker
//!
//! Routes envelopes by `(topic, action)` to registered handlers and
//! correlates requests with their replies.
//!
//! ## Delivery
//!
//! - Handlers run synchronously on the publishing thread, in registration
//!   order. Dispatch for one key is serialized, so every handler of that key
//!   observes the same relative order of envelopes.
//! - An envelope a handler publishes on its own key is queued and delivered
//!   once the current envelope has reached every handler, before the outer
//!   `publish` returns.
//! - Routes exist while they have registrations. The last `unsubscribe` on a
//!   key drops its route.
//! - The handler list is snapshotted when dispatch starts. Handlers added
//!   during a dispatch see the next envelope; handlers removed during a
//!   dispatch are skipped if they have not run yet.
//! - Once `unsubscribe` returns, no new invocation of that handler begins.
//!
//! ## Request / Reply
//!
//! ```text
//! request(env) ──► register pending(id) ──► dispatch(env) ──► PendingReply
//!                          │                                      ▲
//!                          ├─ reply(id) before deadline ──────────┤ Reply
//!                          └─ deadline timer ─────────────────────┘ Timeout
//! ```

use crate::error::BrokerError;
use crate::pending::{PendingReply, PendingRequestStore, ReplyOutcome};
use crate::subscription::{
    DispatchQueue, DrainGuard, DynHandler, EnvelopeStream, MessageHandler, Registration,
    RouteEntry, SubscriberId, SubscriptionHandle,
};
use crate::DEFAULT_REQUEST_TIMEOUT;
use dashmap::DashMap;
use engine_telemetry::{
    log_envelope_event, time_histogram, BUS_DISPATCH_DURATION, BUS_MESSAGES_DELIVERED,
    BUS_MESSAGES_PUBLISHED, BUS_SCHEMA_FAILURES,
};
use engine_types::{MessageEnvelope, MessageType, RouteKey, SchemaRegistry, ValidationMode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Deadline applied to requests issued without an explicit timeout.
    pub request_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Result of handing an envelope to the broker.
#[derive(Debug)]
pub struct Dispatch {
    /// Handlers that ran to completion (for a reply: 1 if it resolved a request).
    pub delivered: usize,
    /// Published from a handler of the same key. Delivery happens after the
    /// envelope being handled, so `delivered` is 0.
    pub queued: bool,
    /// Present when the envelope was a request.
    pub reply: Option<PendingReply>,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub requests: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub stale_replies: u64,
    pub validation_failures: u64,
    pub pending_requests: usize,
    pub routes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    validation_failures: AtomicU64,
}

/// In-process message broker.
///
/// Shared as `Arc<MessageBroker>`; every operation takes `&self`.
pub struct MessageBroker {
    /// Keys with at least one registration.
    routes: DashMap<RouteKey, Arc<RouteEntry>>,
    pending: Arc<PendingRequestStore>,
    schemas: Arc<SchemaRegistry>,
    config: BrokerConfig,
    next_subscription: AtomicU64,
    counters: Counters,
}

impl MessageBroker {
    /// Broker with default configuration and a permissive, empty schema registry.
    pub fn new() -> Self {
        Self::with_config(
            BrokerConfig::default(),
            Arc::new(SchemaRegistry::new(ValidationMode::Permissive)),
        )
    }

    pub fn with_config(config: BrokerConfig, schemas: Arc<SchemaRegistry>) -> Self {
        info!(
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            validation = ?schemas.mode(),
            "Message broker created"
        );
        Self {
            routes: DashMap::new(),
            pending: Arc::new(PendingRequestStore::new()),
            schemas,
            config,
            next_subscription: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Register `handler` for `(topic, action)`.
    ///
    /// Registering the same handler `Arc` again for the same subscriber and
    /// key returns the existing handle and does not add a second invocation.
    pub fn subscribe(
        &self,
        topic: &str,
        action: &str,
        subscriber: impl Into<SubscriberId>,
        handler: DynHandler,
    ) -> Result<SubscriptionHandle, BrokerError> {
        let key = routable_key(topic, action)?;
        let subscriber = subscriber.into();

        loop {
            let entry = Arc::clone(
                self.routes
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(RouteEntry::new()))
                    .value(),
            );

            let mut registrations = entry.registrations.write();
            // Emptied and dropped by a concurrent unsubscribe; fetch the new entry.
            if entry.is_retired() {
                continue;
            }

            if let Some(existing) = registrations
                .iter()
                .find(|reg| reg.matches(&subscriber, &handler))
            {
                debug!(subscriber = %subscriber, route = %key, "Handler already subscribed");
                return Ok(SubscriptionHandle {
                    id: existing.id,
                    key,
                    subscriber,
                });
            }

            let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
            registrations.push(Arc::new(Registration::new(
                id,
                subscriber.clone(),
                handler,
            )));
            debug!(
                subscriber = %subscriber,
                route = %key,
                handlers = registrations.len(),
                "Subscribed"
            );

            return Ok(SubscriptionHandle {
                id,
                key,
                subscriber,
            });
        }
    }

    /// Register a closure. Each call registers a distinct handler.
    pub fn subscribe_fn<F>(
        &self,
        topic: &str,
        action: &str,
        subscriber: impl Into<SubscriberId>,
        handler: F,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        self.subscribe(topic, action, subscriber, handler)
    }

    /// Subscribe with an async stream instead of a callback.
    pub fn subscribe_stream(
        &self,
        topic: &str,
        action: &str,
        subscriber: impl Into<SubscriberId>,
    ) -> Result<(SubscriptionHandle, EnvelopeStream), BrokerError> {
        let (tx, stream) = EnvelopeStream::channel();
        let handle = self.subscribe_fn(topic, action, subscriber, move |envelope| {
            // Receiver gone means the consumer stopped listening.
            let _ = tx.send(envelope.clone());
        })?;
        Ok((handle, stream))
    }

    /// Remove a registration. Returns `false` if it was already removed.
    ///
    /// If the handler is running on another thread, this waits for that
    /// invocation to return. A handler may unsubscribe itself.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(entry) = self.routes.get(&handle.key).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let removed = {
            let mut registrations = entry.registrations.write();
            let removed = registrations
                .iter()
                .position(|reg| reg.id == handle.id)
                .map(|pos| registrations.remove(pos));
            if removed.is_some() && registrations.is_empty() {
                self.drop_route(&handle.key, &entry);
            }
            removed
        };

        match removed {
            Some(registration) => {
                registration.deactivate();
                debug!(subscriber = %handle.subscriber, route = %handle.key, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove every registration owned by `subscriber`.
    ///
    /// Returns the number of registrations removed.
    pub fn unsubscribe_all(&self, subscriber: &SubscriberId) -> usize {
        let entries: Vec<(RouteKey, Arc<RouteEntry>)> = self
            .routes
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut removed = Vec::new();
        for (key, entry) in entries {
            let mut registrations = entry.registrations.write();
            let (theirs, others): (Vec<_>, Vec<_>) = registrations
                .drain(..)
                .partition(|reg| reg.subscriber == *subscriber);
            *registrations = others;
            if !theirs.is_empty() && registrations.is_empty() {
                self.drop_route(&key, &entry);
            }
            removed.extend(theirs);
        }

        // Outside the list locks: deactivation may wait for running handlers.
        for registration in &removed {
            registration.deactivate();
        }

        if !removed.is_empty() {
            debug!(subscriber = %subscriber, count = removed.len(), "Unsubscribed all");
        }
        removed.len()
    }

    /// Number of live registrations for `(topic, action)`.
    pub fn subscriber_count(&self, topic: &str, action: &str) -> usize {
        self.routes
            .get(&RouteKey::new(topic, action))
            .map(|e| Arc::clone(e.value()))
            .map_or(0, |entry| entry.registrations.read().len())
    }

    // =========================================================================
    // PUBLISHING
    // =========================================================================

    /// Hand an envelope to the broker, whatever its message type.
    ///
    /// - `Publish`: delivered to the handlers of its key
    /// - `Request`: as `request()` with the configured default timeout
    /// - `Reply`: as `reply()`
    pub fn publish(&self, envelope: MessageEnvelope) -> Result<Dispatch, BrokerError> {
        match envelope.message_type() {
            MessageType::Publish => {
                self.admit(&envelope)?;
                let delivered = self.dispatch(&envelope);
                Ok(Dispatch {
                    delivered: delivered.unwrap_or(0),
                    queued: delivered.is_none(),
                    reply: None,
                })
            }
            MessageType::Request => {
                let (delivered, reply) = self.issue_request(envelope, self.config.request_timeout)?;
                Ok(Dispatch {
                    delivered: delivered.unwrap_or(0),
                    queued: delivered.is_none(),
                    reply: Some(reply),
                })
            }
            MessageType::Reply => {
                let outcome = self.reply(envelope)?;
                Ok(Dispatch {
                    delivered: usize::from(outcome == ReplyOutcome::Delivered),
                    queued: false,
                    reply: None,
                })
            }
        }
    }

    /// Issue a request with the configured default timeout.
    pub fn request(&self, envelope: MessageEnvelope) -> Result<PendingReply, BrokerError> {
        self.request_with_timeout(envelope, self.config.request_timeout)
    }

    /// Issue a request that resolves to `Timeout` unless answered within `timeout`.
    ///
    /// The pending entry exists before any handler runs, so a handler may
    /// reply synchronously. Must be called within a Tokio runtime.
    pub fn request_with_timeout(
        &self,
        envelope: MessageEnvelope,
        timeout: Duration,
    ) -> Result<PendingReply, BrokerError> {
        self.issue_request(envelope, timeout).map(|(_, reply)| reply)
    }

    fn issue_request(
        &self,
        envelope: MessageEnvelope,
        timeout: Duration,
    ) -> Result<(Option<usize>, PendingReply), BrokerError> {
        expect_type(&envelope, MessageType::Request)?;
        let runtime = Handle::try_current().map_err(|_| BrokerError::NoTimerRuntime)?;
        self.admit(&envelope)?;

        let id = envelope.id().clone();
        let registered = self
            .pending
            .register(id.clone(), envelope.route_key(), timeout)
            .ok_or_else(|| BrokerError::DuplicateRequestId { id: id.clone() })?;

        let store = Arc::clone(&self.pending);
        let (timer_id, ticket, deadline) = (id.clone(), registered.ticket, registered.deadline);
        runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            store.expire(&timer_id, ticket);
        });

        let delivered = self.dispatch(&envelope);
        if delivered == Some(0) {
            log_envelope_event!(debug, envelope, "Request has no handler; it will time out");
        }

        Ok((delivered, PendingReply::new(id, registered)))
    }

    /// Resolve the request this reply answers.
    ///
    /// Replies are never delivered to subscribers. A reply with no pending
    /// request (unknown id, already answered, or past its deadline) is
    /// dropped and reported as `Stale`.
    pub fn reply(&self, envelope: MessageEnvelope) -> Result<ReplyOutcome, BrokerError> {
        expect_type(&envelope, MessageType::Reply)?;
        self.admit(&envelope)?;

        let outcome = self.pending.complete(envelope);
        Ok(outcome)
    }

    /// Validate an envelope against the registered schemas regardless of mode.
    pub fn validate(&self, envelope: &MessageEnvelope) -> Result<(), BrokerError> {
        self.schemas.validate(envelope).map_err(|err| {
            self.counters
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            BUS_SCHEMA_FAILURES.inc();
            log_envelope_event!(warn, envelope, "Schema validation failed", error = %err);
            BrokerError::from(err)
        })
    }

    // =========================================================================
    // STATE
    // =========================================================================

    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    pub fn pending_store(&self) -> &PendingRequestStore {
        &self.pending
    }

    pub fn stats(&self) -> BrokerStats {
        let pending = self.pending.stats();
        BrokerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            requests: pending.total_registered.load(Ordering::Relaxed),
            replies: pending.total_replied.load(Ordering::Relaxed),
            timeouts: pending.total_timeouts.load(Ordering::Relaxed),
            stale_replies: pending.total_stale.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            pending_requests: self.pending.pending_count(),
            routes: self.routes.len(),
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Routing and (in strict mode) schema checks shared by every entry point.
    fn admit(&self, envelope: &MessageEnvelope) -> Result<(), BrokerError> {
        routable_key(envelope.topic(), envelope.action())?;
        if self.schemas.is_strict() {
            self.validate(envelope)?;
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        BUS_MESSAGES_PUBLISHED
            .with_label_values(&[envelope.message_type().as_str()])
            .inc();
        Ok(())
    }

    /// Deliver to the handlers of the envelope's key. Returns `None` when the
    /// envelope was queued behind a dispatch of the same key on this thread.
    fn dispatch(&self, envelope: &MessageEnvelope) -> Option<usize> {
        let Some(entry) = self
            .routes
            .get(&envelope.route_key())
            .map(|e| Arc::clone(e.value()))
        else {
            log_envelope_event!(debug, envelope, "No subscribers");
            return Some(0);
        };

        // Other threads wait here; a handler of this key re-enters and queues.
        let queue = entry.dispatch.lock();
        if !DispatchQueue::claim_or_defer(&queue, envelope) {
            log_envelope_event!(debug, envelope, "Queued behind running dispatch");
            return None;
        }
        let _drain = DrainGuard(&queue);

        let delivered = self.deliver(&entry, envelope);
        while let Some(next) = DispatchQueue::next(&queue) {
            self.deliver(&entry, &next);
        }
        Some(delivered)
    }

    fn deliver(&self, entry: &RouteEntry, envelope: &MessageEnvelope) -> usize {
        let _timer = time_histogram!(BUS_DISPATCH_DURATION);

        let delivered = entry
            .snapshot()
            .iter()
            .filter(|registration| registration.invoke(envelope))
            .count();

        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        BUS_MESSAGES_DELIVERED.inc_by(delivered as f64);
        log_envelope_event!(debug, envelope, "Dispatched", handlers = delivered);
        delivered
    }

    /// Drop an emptied route. Caller holds the entry's registrations write lock.
    fn drop_route(&self, key: &RouteKey, entry: &Arc<RouteEntry>) {
        entry.retire();
        self.routes
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry));
        debug!(route = %key, "Route dropped");
    }
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn routable_key(topic: &str, action: &str) -> Result<RouteKey, BrokerError> {
    let key = RouteKey::new(topic, action);
    if key.is_routable() {
        Ok(key)
    } else {
        Err(BrokerError::InvalidTopic {
            topic: topic.to_string(),
            action: action.to_string(),
        })
    }
}

fn expect_type(envelope: &MessageEnvelope, expected: MessageType) -> Result<(), BrokerError> {
    if envelope.message_type() == expected {
        Ok(())
    } else {
        Err(BrokerError::UnexpectedMessageType {
            id: envelope.id().clone(),
            expected,
            found: envelope.message_type(),
        })
    }
}
