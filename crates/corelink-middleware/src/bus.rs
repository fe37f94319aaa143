//! Topic-based publish/subscribe router.
//!
//! Every subscription binds one [`TopicPattern`] to one async handler owned by
//! one application. Publishing an [`Event`] visits the matching subscriptions
//! one at a time, in registration order, and awaits each handler before
//! moving on to the next.
//!
//! # Patterns
//!
//! | Pattern | Matches |
//! |---|---|
//! | `scene.ready` | exactly `scene.ready` |
//! | `scene.*` | every topic that starts with `scene.` |
//! | `*` | every topic |
//!
//! # Delivery modes
//!
//! * [`DeliveryMode::Inline`] – handlers run on the publisher's task before
//!   [`Router::publish`] returns.
//! * [`DeliveryMode::Queued`] – `publish` pushes into a bounded channel and a
//!   single background task (see [`Router::spawn_delivery`]) drains it in FIFO
//!   order.
//!
//! Either way a failing (or panicking) handler is logged and counted, and
//! delivery continues with the next subscriber. Priority is carried on the
//! event for consumers only; the router never reorders by it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corelink_types::{AppId, CoreError, Event, SubscriptionId, TopicPattern, validate_topic};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default capacity of the queued-mode channel.
pub const DEFAULT_CAPACITY: usize = 1000;

/// What a handler hands back. `Ok` values are collected by
/// [`Router::publish_and_collect`].
pub type HandlerResult = Result<Value, CoreError>;

/// Type-erased async subscriber callback.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Optional predicate evaluated before a handler is invoked.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
///
/// ```
/// use corelink_middleware::handler;
/// use serde_json::Value;
///
/// let h = handler(|event| async move { Ok(Value::from(event.topic.len())) });
/// # let _ = h;
/// ```
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Wrap a predicate as an [`EventFilter`].
pub fn filter<F>(f: F) -> EventFilter
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How [`Router::publish`] hands events to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Inline,
    Queued,
}

/// Point-in-time router counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RouterStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub pending: usize,
    pub subscriptions: usize,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Subscription {
    id: SubscriptionId,
    topic: String,
    pattern: TopicPattern,
    owner: AppId,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

struct Shared {
    // Kept in registration order.
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    pending: AtomicUsize,
    published: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    /// Run every matching handler in registration order and return the `Ok`
    /// results. The subscription lock is released before any handler runs so
    /// handlers may publish or (un)subscribe re-entrantly.
    async fn deliver(&self, event: &Event) -> Vec<Value> {
        let targets: Vec<(SubscriptionId, Option<EventFilter>, EventHandler)> = lock(&self.subscriptions)
            .iter()
            .filter(|s| s.pattern.matches(&event.topic))
            .map(|s| (s.id, s.filter.clone(), Arc::clone(&s.handler)))
            .collect();

        if targets.is_empty() {
            debug!(topic = %event.topic, event_id = %event.id, "no subscribers; event dropped");
            return Vec::new();
        }

        let mut results = Vec::with_capacity(targets.len());
        for (id, filter, handler) in targets {
            if let Some(filter) = filter
                && !filter(event)
            {
                continue;
            }
            match AssertUnwindSafe(handler(event.clone())).catch_unwind().await {
                Ok(Ok(value)) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    results.push(value);
                }
                Ok(Err(e)) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription = %id, topic = %event.topic, error = %e, "handler failed");
                }
                Err(_) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription = %id, topic = %event.topic, "handler panicked");
                }
            }
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The event bus. Share it behind an [`Arc`].
pub struct Router {
    shared: Arc<Shared>,
    mode: DeliveryMode,
    capacity: usize,
    queue_tx: Option<mpsc::Sender<Event>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl Router {
    /// Create a router. `capacity` bounds the queued-mode channel and is
    /// clamped to at least 1; it is only reported in inline mode.
    pub fn new(mode: DeliveryMode, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (queue_tx, queue_rx) = match mode {
            DeliveryMode::Inline => (None, None),
            DeliveryMode::Queued => {
                let (tx, rx) = mpsc::channel(capacity);
                (Some(tx), Some(rx))
            }
        };
        Self {
            shared: Arc::new(Shared::new()),
            mode,
            capacity,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register `handler` for `topic` on behalf of `owner`.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidTopic`] for an empty or malformed pattern.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: EventHandler,
        owner: AppId,
        filter: Option<EventFilter>,
    ) -> Result<SubscriptionId, CoreError> {
        let pattern = TopicPattern::parse(topic)?;
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscriptions).push(Subscription {
            id,
            topic: topic.to_string(),
            pattern,
            owner,
            filter,
            handler,
        });
        debug!(subscription = %id, topic, owner = %owner, "subscribed");
        Ok(id)
    }

    /// Remove one subscription. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.shared.subscriptions);
        match subs.iter().position(|s| s.id == id) {
            Some(index) => {
                let removed = subs.remove(index);
                debug!(subscription = %id, topic = %removed.topic, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription owned by `owner` and return how many went.
    pub fn unsubscribe_all(&self, owner: AppId) -> usize {
        let mut subs = lock(&self.shared.subscriptions);
        let before = subs.len();
        subs.retain(|s| s.owner != owner);
        let removed = before - subs.len();
        if removed > 0 {
            debug!(owner = %owner, removed, "removed all subscriptions for owner");
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Number of subscriptions a publish to `topic` would reach (filters are
    /// not evaluated).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.shared.subscriptions)
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .count()
    }

    /// `(id, pattern)` of every subscription owned by `owner`, in
    /// registration order.
    pub fn subscriptions_owned_by(&self, owner: AppId) -> Vec<(SubscriptionId, String)> {
        lock(&self.shared.subscriptions)
            .iter()
            .filter(|s| s.owner == owner)
            .map(|s| (s.id, s.topic.clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Build an event from its parts and publish it.
    pub async fn publish(&self, topic: &str, payload: Value, source: AppId) -> Result<Uuid, CoreError> {
        self.publish_event(Event::new(topic, payload, source)).await
    }

    /// Publish a fully built event.
    ///
    /// Publishing to a topic nobody listens on is not an error.
    ///
    /// # Errors
    ///
    /// * [`CoreError::InvalidTopic`] for an empty topic.
    /// * [`CoreError::QueueFull`] in queued mode when the backlog is at
    ///   capacity.
    /// * [`CoreError::KernelNotRunning`] in queued mode once the delivery
    ///   task has shut down.
    pub async fn publish_event(&self, event: Event) -> Result<Uuid, CoreError> {
        validate_topic(&event.topic)?;
        let id = event.id;

        match &self.queue_tx {
            None => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                self.shared.deliver(&event).await;
            }
            Some(tx) => {
                self.shared.pending.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = tx.try_send(event) {
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                    return Err(match e {
                        mpsc::error::TrySendError::Full(_) => CoreError::QueueFull {
                            capacity: self.capacity,
                        },
                        mpsc::error::TrySendError::Closed(_) => CoreError::KernelNotRunning,
                    });
                }
                self.shared.published.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(id)
    }

    /// Deliver inline, regardless of mode, and return every successful
    /// handler result in delivery order.
    pub async fn publish_and_collect(
        &self,
        topic: &str,
        payload: Value,
        source: AppId,
    ) -> Result<Vec<Value>, CoreError> {
        validate_topic(topic)?;
        let event = Event::new(topic, payload, source);
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.deliver(&event).await)
    }

    // -----------------------------------------------------------------------
    // Queued delivery
    // -----------------------------------------------------------------------

    /// Start the background task that drains the queued-mode channel.
    ///
    /// Returns `None` in inline mode or when the task was already started.
    /// The task exits when `cancel` fires; events still queued at that point
    /// are dropped.
    pub fn spawn_delivery(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = lock(&self.queue_rx).take()?;
        let shared = Arc::clone(&self.shared);
        info!(capacity = self.capacity, "queued delivery started");
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(event) => {
                            shared.deliver(&event).await;
                            shared.pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        None => break,
                    },
                }
            }
            info!("queued delivery stopped");
        }))
    }

    /// Events accepted in queued mode but not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            handler_errors: self.shared.handler_errors.load(Ordering::Relaxed),
            pending: self.pending(),
            subscriptions: self.subscription_count(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DeliveryMode::Inline, DEFAULT_CAPACITY)
    }
}
