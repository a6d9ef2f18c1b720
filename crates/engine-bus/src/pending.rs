//! # Pending Requests
//!
//! Correlates replies with the requests waiting for them.
//!
//! Flow:
//! 1. The broker calls `register()` before any handler sees the request
//! 2. A timer task calls `expire()` at the deadline
//! 3. `complete()` resolves the request when the matching reply arrives
//!
//! Exactly one of `expire()` and `complete()` wins, because both start by
//! removing the entry from the map. Each registration carries a ticket so a
//! timer left over from an earlier request can never expire a later request
//! that reuses the same id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use engine_telemetry::{BUS_PENDING_REQUESTS, BUS_REQUEST_OUTCOMES, BUS_STALE_REPLIES};
use engine_types::{EnvelopeId, MessageEnvelope, RouteKey};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cap on how far ahead a deadline is set. Longer timeouts never fire in
/// practice and would overflow `Instant`.
const MAX_DEADLINE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Terminal outcome of a request. Exactly one is produced per request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Reply(MessageEnvelope),
    Timeout,
}

impl RequestOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn into_reply(self) -> Option<MessageEnvelope> {
        match self {
            Self::Reply(envelope) => Some(envelope),
            Self::Timeout => None,
        }
    }
}

/// What happened to a reply handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Matched a pending request and resolved it.
    Delivered,
    /// No request with that id was pending; the reply was dropped.
    Stale,
}

/// A request waiting for its reply or deadline.
struct PendingRequest {
    ticket: u64,
    sender: oneshot::Sender<RequestOutcome>,
    created_at: Instant,
    deadline: Instant,
    route: RouteKey,
}

/// Counters for the pending request store.
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Requests registered
    pub total_registered: AtomicU64,
    /// Requests resolved with a reply
    pub total_replied: AtomicU64,
    /// Requests resolved with a timeout
    pub total_timeouts: AtomicU64,
    /// Replies that matched nothing
    pub total_stale: AtomicU64,
    /// Outcomes nobody was waiting for any more
    pub total_abandoned: AtomicU64,
}

/// Ticket and receiver handed back by `register()`.
pub(crate) struct Registered {
    pub(crate) ticket: u64,
    pub(crate) deadline: Instant,
    pub(crate) receiver: oneshot::Receiver<RequestOutcome>,
}

/// Map of in-flight request ids to their waiters.
pub struct PendingRequestStore {
    pending: DashMap<EnvelopeId, PendingRequest>,
    next_ticket: AtomicU64,
    stats: PendingStats,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            stats: PendingStats::default(),
        }
    }

    /// Register a request. Returns `None` if the id is already in flight.
    pub(crate) fn register(
        &self,
        id: EnvelopeId,
        route: RouteKey,
        timeout: Duration,
    ) -> Option<Registered> {
        let entry = match self.pending.entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => entry,
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();
        let deadline = created_at + timeout.min(MAX_DEADLINE);
        let (sender, receiver) = oneshot::channel();

        debug!(
            id = %entry.key(),
            route = %route,
            timeout_ms = timeout.as_millis() as u64,
            "Registered pending request"
        );

        entry.insert(PendingRequest {
            ticket,
            sender,
            created_at,
            deadline,
            route,
        });
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        BUS_PENDING_REQUESTS.inc();

        Some(Registered {
            ticket,
            deadline,
            receiver,
        })
    }

    /// Resolve the request a reply answers.
    ///
    /// A reply that arrives at or after the deadline resolves the request with
    /// `Timeout` and is itself stale, even if the timer has not fired yet.
    pub fn complete(&self, reply: MessageEnvelope) -> ReplyOutcome {
        let id = reply.correlation_id().clone();

        let Some((_, pending)) = self.pending.remove(&id) else {
            self.record_stale(&id);
            return ReplyOutcome::Stale;
        };
        BUS_PENDING_REQUESTS.dec();

        if Instant::now() >= pending.deadline {
            self.resolve(&id, pending, RequestOutcome::Timeout);
            self.record_stale(&id);
            return ReplyOutcome::Stale;
        }

        self.resolve(&id, pending, RequestOutcome::Reply(reply));
        ReplyOutcome::Delivered
    }

    /// Resolve a request with `Timeout` if it is still the registration
    /// identified by `ticket`. Returns whether it was expired here.
    pub fn expire(&self, id: &EnvelopeId, ticket: u64) -> bool {
        match self.pending.remove_if(id, |_, pending| pending.ticket == ticket) {
            Some((_, pending)) => {
                BUS_PENDING_REQUESTS.dec();
                self.resolve(id, pending, RequestOutcome::Timeout);
                true
            }
            None => false,
        }
    }

    /// Expire every request whose deadline has passed.
    ///
    /// Returns the number of requests expired.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(EnvelopeId, u64)> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| (entry.key().clone(), entry.ticket))
            .collect();

        expired
            .into_iter()
            .filter(|(id, ticket)| self.expire(id, *ticket))
            .count()
    }

    fn resolve(&self, id: &EnvelopeId, pending: PendingRequest, outcome: RequestOutcome) {
        let label = if outcome.is_timeout() { "timeout" } else { "reply" };
        if outcome.is_timeout() {
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %id,
                route = %pending.route,
                elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                "Request timed out"
            );
        } else {
            self.stats.total_replied.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %id,
                route = %pending.route,
                response_time_ms = pending.created_at.elapsed().as_millis() as u64,
                "Request answered"
            );
        }
        BUS_REQUEST_OUTCOMES.with_label_values(&[label]).inc();

        if pending.sender.send(outcome).is_err() {
            self.stats.total_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(id = %id, "Requester stopped waiting before resolution");
        }
    }

    fn record_stale(&self, id: &EnvelopeId) {
        self.stats.total_stale.fetch_add(1, Ordering::Relaxed);
        BUS_STALE_REPLIES.inc();
        warn!(id = %id, "Stale reply dropped");
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &EnvelopeId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

impl Default for PendingRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller side of a request. Resolves to the reply or to `Timeout`.
///
/// Dropping it does not cancel the request; the broker still resolves it and
/// discards the outcome.
#[derive(Debug)]
pub struct PendingReply {
    id: EnvelopeId,
    deadline: Instant,
    receiver: oneshot::Receiver<RequestOutcome>,
}

impl PendingReply {
    pub(crate) fn new(id: EnvelopeId, registered: Registered) -> Self {
        Self {
            id,
            deadline: registered.deadline,
            receiver: registered.receiver,
        }
    }

    /// Id of the request this reply answers.
    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Block the current thread until the outcome is known.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_wait(self) -> RequestOutcome {
        self.receiver
            .blocking_recv()
            .unwrap_or(RequestOutcome::Timeout)
    }
}

impl Future for PendingReply {
    type Output = RequestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender only happens if the store itself is gone.
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(RequestOutcome::Timeout))
    }
}
