//! [`Connector`] – the per-application client of a running [`Kernel`].
//!
//! A connector registers its application with the kernel's registry, routes
//! its subscriptions and publishes through the router, and keeps the record
//! alive with a background heartbeat.
//!
//! Subscriptions declared before [`Connector::connect`] are buffered and
//! bound to the application id on every connect, so an application can lay
//! out its handlers up front and reconnect without redeclaring them.
//!
//! # Request / reply
//!
//! [`Connector::request`] subscribes to a one-off `_reply.<uuid>` topic,
//! publishes the request with that topic under the `reply_to` metadata key
//! and waits for the first answer. The responder calls
//! [`Connector::reply`] with the request event it received.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use corelink_kernel::{Kernel, KernelConfig};
//! use corelink_middleware::handler;
//! use corelink_runtime::Connector;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), corelink_types::CoreError> {
//! let kernel = Kernel::new(KernelConfig::default());
//! kernel.start().await?;
//!
//! let echo = Arc::new(Connector::new("echo", "1.0"));
//! let responder = Arc::clone(&echo);
//! echo.subscribe("echo.ask", handler(move |event| {
//!     let responder = Arc::clone(&responder);
//!     async move {
//!         responder
//!             .reply(&event, event.payload.clone())
//!             .await
//!             .map(|_| serde_json::Value::Null)
//!     }
//! }))?;
//! echo.connect(&kernel).await?;
//!
//! let client = Connector::new("client", "1.0");
//! client.connect(&kernel).await?;
//! let answer = client.request("echo.ask", json!("ping"), Duration::from_secs(1)).await?;
//! assert_eq!(answer, json!("ping"));
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corelink_kernel::{Kernel, Registry};
use corelink_middleware::{EventFilter, EventHandler, Router, handler};
use corelink_types::{
    AppId, Capabilities, CoreError, Event, Metadata, Priority, REPLY_TO_KEY, SubscriptionId,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Heartbeat period used unless [`Connector::with_heartbeat_interval`] says
/// otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Prefix of the private response topics used by [`Connector::request`].
pub const REPLY_TOPIC_PREFIX: &str = "_reply.";

/// Returned by [`Connector::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub app_id: AppId,
    pub name: String,
    pub connected_at: DateTime<Utc>,
}

struct PendingSubscription {
    topic: String,
    handler: EventHandler,
    filter: Option<EventFilter>,
}

struct Session {
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    router: Arc<Router>,
    heartbeat_cancel: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<PendingSubscription>,
    session: Option<Session>,
}

/// Client facade for one application. Wrap it in an [`Arc`] when handlers
/// need to call back into it (for example to [`reply`][Connector::reply]).
pub struct Connector {
    name: String,
    version: String,
    capabilities: Capabilities,
    metadata: Metadata,
    heartbeat_interval: Duration,
    inner: Mutex<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connector {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capabilities: Capabilities::new(),
            metadata: Metadata::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry id of the current connection.
    pub fn app_id(&self) -> Option<AppId> {
        lock(&self.inner).session.as_ref().map(|s| s.handle.app_id)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).session.is_some()
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        lock(&self.inner).session.as_ref().map(|s| s.handle.clone())
    }

    /// Topics buffered for the next connect.
    pub fn pending_topics(&self) -> Vec<String> {
        lock(&self.inner).pending.iter().map(|p| p.topic.clone()).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Register with `kernel`, bind buffered subscriptions and start the
    /// heartbeat.
    ///
    /// # Errors
    ///
    /// * [`CoreError::AlreadyConnected`] if this connector holds a connection.
    /// * [`CoreError::KernelNotRunning`] if `kernel` is not running.
    /// * Registration errors ([`CoreError::CapacityExceeded`],
    ///   [`CoreError::DuplicateName`]).
    pub async fn connect(&self, kernel: &Kernel) -> Result<ConnectionHandle, CoreError> {
        let mut inner = lock(&self.inner);
        if inner.session.is_some() {
            return Err(CoreError::AlreadyConnected);
        }
        let registry = kernel.registry()?;
        let router = kernel.router()?;

        let record = registry.register(
            &self.name,
            &self.version,
            self.capabilities.clone(),
            self.metadata.clone(),
        )?;
        let app_id = record.id;
        registry.connect(app_id);

        for pending in &inner.pending {
            match router.subscribe(&pending.topic, Arc::clone(&pending.handler), app_id, pending.filter.clone()) {
                Ok(_) => {
                    registry.add_topic(app_id, &pending.topic);
                }
                Err(e) => warn!(app = %self.name, topic = %pending.topic, error = %e, "buffered subscription rejected"),
            }
        }

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&registry),
            app_id,
            self.heartbeat_interval,
            heartbeat_cancel.clone(),
        ));

        let handle = ConnectionHandle {
            app_id,
            name: self.name.clone(),
            connected_at: Utc::now(),
        };
        inner.session = Some(Session {
            handle: handle.clone(),
            registry,
            router,
            heartbeat_cancel,
            heartbeat: Some(heartbeat),
        });
        info!(app = %self.name, app_id = %app_id, "connector connected");
        Ok(handle)
    }

    /// Stop the heartbeat, drop this app's subscriptions and mark it
    /// disconnected. Does nothing when not connected.
    pub async fn disconnect(&self) {
        let Some(mut session) = lock(&self.inner).session.take() else {
            return;
        };
        session.heartbeat_cancel.cancel();
        if let Some(heartbeat) = session.heartbeat.take() {
            if let Err(e) = heartbeat.await {
                if !e.is_cancelled() {
                    warn!(app = %self.name, error = %e, "heartbeat task ended abnormally");
                }
            }
        }

        let app_id = session.handle.app_id;
        let removed = session.router.unsubscribe_all(app_id);
        session.registry.clear_topics(app_id);
        session.registry.disconnect(app_id);
        info!(app = %self.name, app_id = %app_id, removed, "connector disconnected");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe `handler` to `topic`. Buffered (returns `None`) until the
    /// connector is connected.
    pub fn subscribe(&self, topic: &str, handler: EventHandler) -> Result<Option<SubscriptionId>, CoreError> {
        self.subscribe_inner(topic, handler, None)
    }

    /// Like [`subscribe`][Self::subscribe], but `filter` must accept an event
    /// before `handler` sees it.
    pub fn subscribe_filtered(
        &self,
        topic: &str,
        handler: EventHandler,
        filter: EventFilter,
    ) -> Result<Option<SubscriptionId>, CoreError> {
        self.subscribe_inner(topic, handler, Some(filter))
    }

    fn subscribe_inner(
        &self,
        topic: &str,
        handler: EventHandler,
        filter: Option<EventFilter>,
    ) -> Result<Option<SubscriptionId>, CoreError> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        match &inner.session {
            Some(session) => {
                let app_id = session.handle.app_id;
                let id = session.router.subscribe(topic, handler, app_id, filter)?;
                session.registry.add_topic(app_id, topic);
                Ok(Some(id))
            }
            None => {
                // Reject bad patterns now rather than at connect time.
                corelink_types::TopicPattern::parse(topic)?;
                inner.pending.push(PendingSubscription {
                    topic: topic.to_string(),
                    handler,
                    filter,
                });
                debug!(app = %self.name, topic, "subscription buffered until connect");
                Ok(None)
            }
        }
    }

    /// Remove a live subscription. Returns `false` when unknown or not
    /// connected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let inner = lock(&self.inner);
        let Some(session) = &inner.session else {
            return false;
        };
        let app_id = session.handle.app_id;
        let topic = session
            .router
            .subscriptions_owned_by(app_id)
            .into_iter()
            .find(|(sub, _)| *sub == id)
            .map(|(_, topic)| topic);
        match topic {
            Some(topic) => {
                session.registry.remove_topic(app_id, &topic);
                session.router.unsubscribe(id)
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish `payload` on `topic` with this app as the source.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotConnected`] before [`connect`][Self::connect], plus any
    /// router error.
    pub async fn emit(&self, topic: &str, payload: Value, metadata: Option<Metadata>) -> Result<Uuid, CoreError> {
        self.emit_with_priority(topic, payload, metadata, Priority::Normal).await
    }

    pub async fn emit_with_priority(
        &self,
        topic: &str,
        payload: Value,
        metadata: Option<Metadata>,
        priority: Priority,
    ) -> Result<Uuid, CoreError> {
        let (app_id, router) = self.session_parts()?;
        let event = Event::new(topic, payload, app_id)
            .with_metadata(metadata.unwrap_or_default())
            .with_priority(priority);
        router.publish_event(event).await
    }

    /// Publish a request and wait up to `timeout` for the first reply.
    ///
    /// The private response subscription is removed whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`CoreError::Timeout`] when no reply arrives in time. Not retried.
    pub async fn request(&self, topic: &str, payload: Value, timeout: Duration) -> Result<Value, CoreError> {
        let (app_id, router) = self.session_parts()?;
        let reply_topic = format!("{REPLY_TOPIC_PREFIX}{}", Uuid::new_v4());

        let (tx, rx) = oneshot::channel::<Value>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let on_reply = handler(move |event: Event| {
            let sender = lock(&slot).take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(event.payload);
                }
                Ok(Value::Null)
            }
        });
        let subscription = router.subscribe(&reply_topic, on_reply, app_id, None)?;

        let event = Event::new(topic, payload, app_id).with_meta(REPLY_TO_KEY, reply_topic.as_str());
        let outcome = match router.publish_event(event).await {
            Ok(_) => tokio::time::timeout(timeout, rx).await,
            Err(e) => {
                router.unsubscribe(subscription);
                return Err(e);
            }
        };
        router.unsubscribe(subscription);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            // The sender only disappears unanswered if the subscription was
            // torn down under us; report it like a missed deadline.
            Ok(Err(_)) | Err(_) => {
                debug!(topic, reply_topic = %reply_topic, "request timed out");
                Err(CoreError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Answer a request event received by one of this connector's handlers.
    ///
    /// # Errors
    ///
    /// [`CoreError::MissingReplyTo`] when `request` carries no `reply_to`.
    pub async fn reply(&self, request: &Event, payload: Value) -> Result<Uuid, CoreError> {
        let reply_topic = request.reply_to().ok_or(CoreError::MissingReplyTo)?.to_string();
        let (app_id, router) = self.session_parts()?;
        router.publish_event(Event::new(reply_topic, payload, app_id)).await
    }

    fn session_parts(&self) -> Result<(AppId, Arc<Router>), CoreError> {
        lock(&self.inner)
            .session
            .as_ref()
            .map(|s| (s.handle.app_id, Arc::clone(&s.router)))
            .ok_or(CoreError::NotConnected)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = inner.session.take() {
            session.heartbeat_cancel.cancel();
            let app_id = session.handle.app_id;
            let removed = session.router.unsubscribe_all(app_id);
            session.registry.clear_topics(app_id);
            session.registry.disconnect(app_id);
            debug!(app = %self.name, app_id = %app_id, removed, "connector dropped while connected");
        }
    }
}

async fn heartbeat_loop(registry: Arc<Registry>, app_id: AppId, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !registry.heartbeat(app_id) {
            warn!(app_id = %app_id, "heartbeat rejected; record is gone");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_kernel::KernelConfig;
    use corelink_types::AppState;
    use serde_json::json;

    async fn running_kernel() -> Kernel {
        let kernel = Kernel::new(KernelConfig {
            auto_heal: false,
            ..Default::default()
        });
        kernel.start().await.unwrap();
        kernel
    }

    fn noop() -> EventHandler {
        handler(|_| async { Ok(Value::Null) })
    }

    #[tokio::test]
    async fn connect_requires_running_kernel() {
        let kernel = Kernel::new(KernelConfig::default());
        let connector = Connector::new("early", "1");
        assert!(matches!(connector.connect(&kernel).await, Err(CoreError::KernelNotRunning)));
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let kernel = running_kernel().await;
        let connector = Connector::new("twice", "1");
        let handle = connector.connect(&kernel).await.unwrap();
        assert_eq!(handle.name, "twice");
        assert_eq!(connector.app_id(), Some(handle.app_id));
        assert!(matches!(connector.connect(&kernel).await, Err(CoreError::AlreadyConnected)));

        let record = kernel.registry().unwrap().get(handle.app_id).unwrap();
        assert_eq!(record.state, AppState::Connected);
    }

    #[tokio::test]
    async fn buffered_subscriptions_bind_on_connect() {
        let kernel = running_kernel().await;
        let connector = Connector::new("buffered", "1");
        assert_eq!(connector.subscribe("scene.*", noop()).unwrap(), None);
        assert_eq!(connector.pending_topics(), vec!["scene.*".to_string()]);

        let handle = connector.connect(&kernel).await.unwrap();
        let router = kernel.router().unwrap();
        assert_eq!(router.subscriptions_owned_by(handle.app_id).len(), 1);
        let record = kernel.registry().unwrap().get(handle.app_id).unwrap();
        assert_eq!(record.topics, vec!["scene.*".to_string()]);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected_before_connect() {
        let connector = Connector::new("bad", "1");
        assert!(matches!(connector.subscribe(".*", noop()), Err(CoreError::InvalidTopic(_))));
        assert!(connector.pending_topics().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_updates_router_and_record() {
        let kernel = running_kernel().await;
        let connector = Connector::new("subs", "1");
        let handle = connector.connect(&kernel).await.unwrap();
        let id = connector.subscribe("a", noop()).unwrap().expect("live subscription");

        assert!(connector.unsubscribe(id));
        assert!(!connector.unsubscribe(id));
        let record = kernel.registry().unwrap().get(handle.app_id).unwrap();
        assert!(record.topics.is_empty());
    }

    #[tokio::test]
    async fn emit_before_connect_fails() {
        let connector = Connector::new("quiet", "1");
        let err = connector.emit("a", json!(1), None).await.unwrap_err();
        assert_eq!(err, CoreError::NotConnected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_cleans_up() {
        let kernel = running_kernel().await;
        let connector = Connector::new("leaver", "1");
        connector.subscribe("x.*", noop()).unwrap();
        let handle = connector.connect(&kernel).await.unwrap();
        connector.subscribe("y", noop()).unwrap();

        connector.disconnect().await;
        connector.disconnect().await;

        assert!(!connector.is_connected());
        assert_eq!(kernel.router().unwrap().subscription_count(), 0);
        let record = kernel.registry().unwrap().get(handle.app_id).unwrap();
        assert_eq!(record.state, AppState::Disconnected);
        assert!(record.topics.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_connected_connector_releases_its_record() {
        let kernel = running_kernel().await;
        let connector = Connector::new("dropped", "1");
        let handle = connector.connect(&kernel).await.unwrap();
        connector.subscribe("telemetry.*", noop()).unwrap();
        assert_eq!(kernel.router().unwrap().subscription_count(), 1);

        drop(connector);

        assert_eq!(kernel.router().unwrap().subscription_count(), 0);
        let record = kernel.registry().unwrap().get(handle.app_id).unwrap();
        assert_eq!(record.state, AppState::Disconnected);
        assert!(record.topics.is_empty());

        // The name is free again.
        let successor = Connector::new("dropped", "2");
        successor.connect(&kernel).await.unwrap();
        successor.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_replays_buffered_subscriptions() {
        let kernel = running_kernel().await;
        let connector = Connector::new("again", "1");
        connector.subscribe("news.*", noop()).unwrap();
        connector.connect(&kernel).await.unwrap();
        connector.disconnect().await;

        let handle = connector.connect(&kernel).await.unwrap();
        assert_eq!(kernel.router().unwrap().subscriptions_owned_by(handle.app_id).len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_record() {
        let kernel = running_kernel().await;
        let connector = Connector::new("beating", "1").with_heartbeat_interval(Duration::from_millis(10));
        let handle = connector.connect(&kernel).await.unwrap();
        let registry = kernel.registry().unwrap();
        let first = registry.get(handle.app_id).unwrap().last_heartbeat;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let later = registry.get(handle.app_id).unwrap().last_heartbeat;
        assert!(later > first);
        connector.disconnect().await;
    }

    #[tokio::test]
    async fn reply_without_reply_to_fails() {
        let kernel = running_kernel().await;
        let connector = Connector::new("responder", "1");
        connector.connect(&kernel).await.unwrap();
        let plain = Event::new("ask", json!(1), AppId::SYSTEM);
        assert_eq!(connector.reply(&plain, json!(2)).await.unwrap_err(), CoreError::MissingReplyTo);
    }

    #[tokio::test]
    async fn request_gets_first_reply() {
        let kernel = running_kernel().await;
        let responder = Arc::new(Connector::new("doubler", "1"));
        let me = Arc::clone(&responder);
        responder
            .subscribe(
                "math.double",
                handler(move |event: Event| {
                    let me = Arc::clone(&me);
                    async move {
                        let n = event.payload.as_i64().unwrap_or_default();
                        me.reply(&event, json!(n * 2)).await.map(|_| Value::Null)
                    }
                }),
            )
            .unwrap();
        responder.connect(&kernel).await.unwrap();

        let client = Connector::new("asker", "1").with_capabilities(["math"]);
        client.connect(&kernel).await.unwrap();
        let answer = client.request("math.double", json!(21), Duration::from_millis(500)).await.unwrap();
        assert_eq!(answer, json!(42));

        // Only the responder's subscription is left.
        assert_eq!(kernel.router().unwrap().subscription_count(), 1);
        responder.disconnect().await;
    }
}
