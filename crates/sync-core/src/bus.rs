//! Publish/subscribe registry keyed by [`EventKind`].
//!
//! Every registration owns an ordered mailbox drained by one task on a
//! [`TaskTracker`]. `dispatch` only enqueues, so it never waits for a
//! subscriber, and each subscriber sees events in the order they were
//! published. A failing or panicking callback only loses its own invocation;
//! failures are logged at the bus boundary and go nowhere else.
//!
//! One-shot waiters ([`EventBus::wait_for`]) are checked inside `dispatch`,
//! which makes "first matching event after registration" exact. Predicates
//! run with the registry unlocked and may call back into the bus.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace, warn};

use crate::event::{EventKind, SyncEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
    #[error("wait predicate panicked")]
    PredicatePanicked,
}

/// Error returned by a subscriber callback. Logged by the bus, never propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SubscriberError(String);

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type SubscriberFuture = Pin<Box<dyn Future<Output = Result<(), SubscriberError>> + Send>>;

type Callback = dyn Fn(SyncEvent) -> SubscriberFuture + Send + Sync;
type Predicate = Arc<dyn Fn(&SyncEvent) -> bool + Send + Sync>;

/// Event callback. Clones share identity, which is what `unsubscribe` matches on.
#[derive(Clone)]
pub struct Subscriber {
    callback: Arc<Callback>,
}

impl Subscriber {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(SyncEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        let callback: Arc<Callback> =
            Arc::new(move |event: SyncEvent| -> SubscriberFuture { Box::pin(callback(event)) });
        Self { callback }
    }

    /// Wrap a synchronous callback.
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(SyncEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        Self::new(move |event| std::future::ready(callback(event)))
    }

    fn invoke(&self, event: SyncEvent) -> SubscriberFuture {
        (self.callback)(event)
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("callback", &Arc::as_ptr(&self.callback).cast::<()>())
            .finish()
    }
}

/// One registration. Dropping it closes the mailbox; the drain task finishes
/// whatever is already queued and exits.
struct Mailbox {
    subscriber: Subscriber,
    tx: mpsc::UnboundedSender<SyncEvent>,
}

struct Waiter {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<Result<SyncEvent, BusError>>,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    subscribers: HashMap<EventKind, Vec<Mailbox>>,
    waiters: HashMap<EventKind, Vec<Waiter>>,
}

struct BusInner {
    registry: Mutex<Registry>,
    tracker: TaskTracker,
    /// Deliveries enqueued but not yet finished.
    in_flight: Arc<watch::Sender<usize>>,
    next_waiter_id: AtomicU64,
}

/// Process-wide event registry. Cheap to clone; clones share state.
///
/// `subscribe` and `subscribe_until` spawn tasks and must run inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                tracker: TaskTracker::new(),
                in_flight: Arc::new(in_flight),
                next_waiter_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `subscriber` for `kind`.
    ///
    /// Registrations are not deduplicated: subscribing the same callback twice
    /// delivers every event to it twice.
    pub fn subscribe(&self, kind: EventKind, subscriber: Subscriber) {
        let mut registry = self.lock();
        if registry.closed {
            debug!(?kind, "ignoring subscription on closed event bus");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.tracker.spawn(drain_mailbox(
            kind,
            subscriber.clone(),
            rx,
            Arc::clone(&self.inner.in_flight),
        ));
        registry
            .subscribers
            .entry(kind)
            .or_default()
            .push(Mailbox { subscriber, tx });
    }

    /// Remove one registration equal to `subscriber`. Returns whether one was found.
    ///
    /// Events already queued for that registration are still delivered.
    pub fn unsubscribe(&self, kind: EventKind, subscriber: &Subscriber) -> bool {
        let mut registry = self.lock();
        let Some(mailboxes) = registry.subscribers.get_mut(&kind) else {
            return false;
        };
        let Some(index) = mailboxes.iter().position(|m| m.subscriber == *subscriber) else {
            return false;
        };
        mailboxes.remove(index);
        if mailboxes.is_empty() {
            registry.subscribers.remove(&kind);
        }
        true
    }

    /// Subscribe for as long as the returned guard lives.
    pub fn subscribe_scoped(&self, kind: EventKind, subscriber: Subscriber) -> SubscriptionGuard {
        self.subscribe(kind, subscriber.clone());
        SubscriptionGuard {
            bus: self.clone(),
            kind,
            subscriber: Some(subscriber),
        }
    }

    /// Subscribe until `scope` is cancelled.
    pub fn subscribe_until(
        &self,
        scope: CancellationToken,
        kind: EventKind,
        subscriber: Subscriber,
    ) {
        let guard = self.subscribe_scoped(kind, subscriber);
        tokio::spawn(async move {
            scope.cancelled().await;
            drop(guard);
        });
    }

    /// Resolve with the first event of `kind` satisfying `predicate` that is
    /// dispatched after this call.
    ///
    /// The waiter is registered immediately. It is removed as soon as it
    /// fires, or when the returned future is dropped, whichever comes first.
    pub fn wait_for<P>(&self, kind: EventKind, predicate: P) -> EventWaiter
    where
        P: Fn(&SyncEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.lock();
        if registry.closed {
            let _ = tx.send(Err(BusError::Closed));
        } else {
            registry.waiters.entry(kind).or_default().push(Waiter {
                id,
                predicate: Arc::new(predicate),
                tx,
            });
        }
        drop(registry);

        EventWaiter {
            bus: self.clone(),
            kind,
            id,
            rx,
        }
    }

    /// [`wait_for`](Self::wait_for) without a predicate.
    pub fn wait_for_next(&self, kind: EventKind) -> EventWaiter {
        self.wait_for(kind, |_| true)
    }

    /// Deliver `event` to every waiter and subscriber registered for its kind.
    ///
    /// Returns the number of deliveries made or enqueued. Subscriber callbacks
    /// may still be running when this returns; see [`settle`](Self::settle).
    pub fn dispatch(&self, event: SyncEvent) -> usize {
        let kind = event.kind();

        let (candidates, mut delivered) = {
            let registry = self.lock();
            if registry.closed {
                debug!(?kind, "dropping event dispatched on closed event bus");
                return 0;
            }

            // Enqueued under the lock so concurrent dispatchers agree on one
            // order for every mailbox.
            let mut enqueued = 0;
            for mailbox in registry.subscribers.get(&kind).into_iter().flatten() {
                self.inner.in_flight.send_modify(|count| *count += 1);
                if mailbox.tx.send(event.clone()).is_ok() {
                    enqueued += 1;
                } else {
                    self.inner.in_flight.send_modify(|count| *count -= 1);
                }
            }

            let candidates: Vec<(u64, Predicate)> = registry
                .waiters
                .get(&kind)
                .into_iter()
                .flatten()
                .map(|waiter| (waiter.id, Arc::clone(&waiter.predicate)))
                .collect();
            (candidates, enqueued)
        };

        let outcomes: Vec<(u64, bool)> = candidates
            .into_iter()
            .filter_map(|(id, predicate)| {
                match catch_unwind(AssertUnwindSafe(|| predicate(&event))) {
                    Ok(true) => Some((id, true)),
                    Ok(false) => None,
                    Err(_) => Some((id, false)),
                }
            })
            .collect();

        if !outcomes.is_empty() {
            let mut registry = self.lock();
            if let Some(waiters) = registry.waiters.get_mut(&kind) {
                for (id, matched) in outcomes {
                    // Gone when it fired for a concurrent dispatch or was dropped.
                    let Some(index) = waiters.iter().position(|w| w.id == id) else {
                        continue;
                    };
                    let waiter = waiters.remove(index);
                    if matched {
                        if waiter.tx.send(Ok(event.clone())).is_ok() {
                            delivered += 1;
                        }
                    } else {
                        warn!(?kind, waiter_id = waiter.id, "wait predicate panicked");
                        let _ = waiter.tx.send(Err(BusError::PredicatePanicked));
                    }
                }
                if waiters.is_empty() {
                    registry.waiters.remove(&kind);
                }
            }
        }

        trace!(?kind, delivered, "event dispatched");
        delivered
    }

    /// Wait until every delivery enqueued so far has finished.
    pub async fn settle(&self) {
        let mut idle = self.inner.in_flight.subscribe();
        // The sender lives as long as the bus, so this only returns once idle.
        let _ = idle.wait_for(|count| *count == 0).await;
    }

    /// Stop accepting work: pending waiters fail with [`BusError::Closed`],
    /// subscribers are dropped, and queued deliveries are awaited.
    pub async fn close(&self) {
        let mailboxes = {
            let mut registry = self.lock();
            registry.closed = true;
            for (_, waiters) in registry.waiters.drain() {
                for waiter in waiters {
                    let _ = waiter.tx.send(Err(BusError::Closed));
                }
            }
            std::mem::take(&mut registry.subscribers)
        };
        drop(mailboxes);
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().subscribers.get(&kind).map_or(0, Vec::len)
    }

    pub fn waiter_count(&self, kind: EventKind) -> usize {
        self.lock().waiters.get(&kind).map_or(0, Vec::len)
    }

    fn remove_waiter(&self, kind: EventKind, id: u64) {
        let mut registry = self.lock();
        if let Some(waiters) = registry.waiters.get_mut(&kind) {
            waiters.retain(|waiter| waiter.id != id);
            if waiters.is_empty() {
                registry.waiters.remove(&kind);
            }
        }
    }

    // The registry is only ever mutated by single push/remove calls, so a
    // poisoned lock still holds a consistent value.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deliver one registration's events in order until its mailbox closes.
async fn drain_mailbox(
    kind: EventKind,
    subscriber: Subscriber,
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
    in_flight: Arc<watch::Sender<usize>>,
) {
    while let Some(event) = rx.recv().await {
        let invocation = subscriber.clone();
        // A panic ends this invocation's task, not the mailbox.
        let outcome = tokio::spawn(async move { invocation.invoke(event).await }).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(?kind, error = %err, "event subscriber failed"),
            Err(err) if err.is_panic() => warn!(?kind, "event subscriber panicked"),
            Err(_) => debug!(?kind, "event subscriber cancelled"),
        }
        in_flight.send_modify(|count| *count = count.saturating_sub(1));
    }
    trace!(?kind, "subscriber mailbox closed");
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("in_flight", &*self.inner.in_flight.borrow())
            .finish()
    }
}

/// Unsubscribes when dropped.
#[must_use = "dropping the guard unsubscribes immediately"]
#[derive(Debug)]
pub struct SubscriptionGuard {
    bus: EventBus,
    kind: EventKind,
    subscriber: Option<Subscriber>,
}

impl SubscriptionGuard {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            self.bus.unsubscribe(self.kind, &subscriber);
        }
    }
}

/// Pending one-shot wait. Dropping it deregisters the waiter.
#[must_use = "the waiter is removed when dropped"]
#[derive(Debug)]
pub struct EventWaiter {
    bus: EventBus,
    kind: EventKind,
    id: u64,
    rx: oneshot::Receiver<Result<SyncEvent, BusError>>,
}

impl Future for EventWaiter {
    type Output = Result<SyncEvent, BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BusError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.bus.remove_waiter(self.kind, self.id);
    }
}
