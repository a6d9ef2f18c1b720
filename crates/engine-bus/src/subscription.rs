//! # Subscriptions
//!
//! Handler registrations, the handles callers use to remove them, and the
//! stream adapter for consumers that prefer `async` pull over callbacks.

use engine_types::{MessageEnvelope, RouteKey};
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::error;

/// Identity of whoever registered a handler, usually the owning service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Callback invoked for every envelope routed to its key.
///
/// Handlers run synchronously on the publishing thread and must not block
/// for long; long work belongs on a task the handler spawns.
///
/// Dispatch holds a per-key lock while handlers run. Publishing from a
/// handler is fine on its own thread, for any key. Two handlers running on
/// different threads that each publish into the other's key wait on each
/// other forever; hand such chains to a spawned task instead.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &MessageEnvelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&MessageEnvelope) + Send + Sync,
{
    fn handle(&self, envelope: &MessageEnvelope) {
        self(envelope)
    }
}

/// Shared handler reference. Subscribing the same `Arc` twice for the same
/// subscriber and key is a no-op.
pub type DynHandler = Arc<dyn MessageHandler>;

/// Opaque handle returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) key: RouteKey,
    pub(crate) subscriber: SubscriberId,
}

impl SubscriptionHandle {
    pub fn route_key(&self) -> &RouteKey {
        &self.key
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }
}

/// One handler registered under one key.
pub(crate) struct Registration {
    pub(crate) id: u64,
    pub(crate) subscriber: SubscriberId,
    handler: DynHandler,
    active: AtomicBool,
    /// Held for the duration of each invocation and by `deactivate`.
    /// Reentrant so a handler may unsubscribe itself.
    gate: ReentrantMutex<()>,
}

impl Registration {
    pub(crate) fn new(id: u64, subscriber: SubscriberId, handler: DynHandler) -> Self {
        Self {
            id,
            subscriber,
            handler,
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn matches(&self, subscriber: &SubscriberId, handler: &DynHandler) -> bool {
        self.subscriber == *subscriber
            && std::ptr::addr_eq(Arc::as_ptr(&self.handler), Arc::as_ptr(handler))
    }

    /// Invoke the handler unless the registration was removed. Returns whether
    /// the handler ran to completion.
    pub(crate) fn invoke(&self, envelope: &MessageEnvelope) -> bool {
        let _gate = self.gate.lock();
        if !self.active.load(Ordering::Acquire) {
            return false;
        }

        // A panicking handler must not take down the publisher or starve the
        // handlers after it.
        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(envelope))) {
            Ok(()) => true,
            Err(_) => {
                error!(
                    subscriber = %self.subscriber,
                    topic = %envelope.topic(),
                    action = %envelope.action(),
                    id = %envelope.id(),
                    "Handler panicked"
                );
                false
            }
        }
    }

    /// Mark inactive. Blocks until an invocation running on another thread
    /// has returned.
    pub(crate) fn deactivate(&self) {
        let _gate = self.gate.lock();
        self.active.store(false, Ordering::Release);
    }
}

/// All registrations for one routing key.
pub(crate) struct RouteEntry {
    pub(crate) registrations: RwLock<Vec<Arc<Registration>>>,
    /// Serializes dispatch per key so every handler sees the same order.
    /// Reentrant so a handler may publish on its own key; such envelopes are
    /// queued and drained by the outermost dispatch.
    pub(crate) dispatch: ReentrantMutex<RefCell<DispatchQueue>>,
    /// Set, under the registrations write lock, once the entry was emptied and
    /// dropped from the routing table. Subscribers must not land here.
    retired: AtomicBool,
}

impl RouteEntry {
    pub(crate) fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            dispatch: ReentrantMutex::new(RefCell::new(DispatchQueue::default())),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.registrations.read().clone()
    }

    /// Caller must hold the registrations write lock.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Envelopes published on a key by one of its own handlers.
#[derive(Default)]
pub(crate) struct DispatchQueue {
    draining: bool,
    deferred: VecDeque<MessageEnvelope>,
}

impl DispatchQueue {
    /// Claim the drain for this key, or queue `envelope` behind the drain
    /// already running on this thread. Returns whether the drain was claimed.
    pub(crate) fn claim_or_defer(queue: &RefCell<Self>, envelope: &MessageEnvelope) -> bool {
        let mut queue = queue.borrow_mut();
        if queue.draining {
            queue.deferred.push_back(envelope.clone());
            false
        } else {
            queue.draining = true;
            true
        }
    }

    pub(crate) fn next(queue: &RefCell<Self>) -> Option<MessageEnvelope> {
        queue.borrow_mut().deferred.pop_front()
    }
}

/// Releases a claimed drain, even if delivery unwinds.
pub(crate) struct DrainGuard<'a>(pub(crate) &'a RefCell<DispatchQueue>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.borrow_mut();
        queue.draining = false;
        queue.deferred.clear();
    }
}

/// Async stream of envelopes delivered to a stream subscription.
///
/// Ends once the subscription is removed and the buffered envelopes are drained.
pub struct EnvelopeStream {
    inner: UnboundedReceiverStream<MessageEnvelope>,
}

impl EnvelopeStream {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<MessageEnvelope>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                inner: UnboundedReceiverStream::new(rx),
            },
        )
    }

    /// Receive the next envelope.
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        self.inner.next().await
    }
}

impl Stream for EnvelopeStream {
    type Item = MessageEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
