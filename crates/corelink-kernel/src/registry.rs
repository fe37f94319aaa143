//! [`Registry`] – application identity and connection-state tracking.
//!
//! Every application that wants to talk through the kernel registers here
//! first and receives a fresh [`AppId`]. The registry tracks its
//! [`AppState`], advertised capabilities, subscribed topics and last
//! heartbeat. It never evicts on its own: staleness is reported by the
//! health monitor, and disconnected records are only removed by
//! [`Registry::remove_disconnected`] or [`Registry::unregister`].
//!
//! # Example
//!
//! ```
//! use corelink_kernel::registry::Registry;
//! use corelink_types::{AppState, Capabilities, Metadata};
//!
//! let registry = Registry::new(8);
//! let app = registry
//!     .register("renderer", "1.0.0", Capabilities::new(), Metadata::new())
//!     .unwrap();
//! assert_eq!(app.state, AppState::Registered);
//!
//! registry.heartbeat(app.id);
//! assert_eq!(registry.get(app.id).unwrap().state, AppState::Connected);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use corelink_types::{AppId, AppRecord, AppState, Capabilities, CoreError, Metadata, TopicPattern};
use tracing::{debug, info};

/// Invoked with the app id after a record transitions to `disconnected`.
pub type DisconnectCallback = Arc<dyn Fn(AppId) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set of registered applications, bounded by `max_apps`.
pub struct Registry {
    max_apps: usize,
    // Kept in registration order.
    apps: Mutex<Vec<AppRecord>>,
    total_registered: AtomicU64,
    on_disconnect: Mutex<Vec<DisconnectCallback>>,
}

impl Registry {
    pub fn new(max_apps: usize) -> Self {
        Self {
            max_apps,
            apps: Mutex::new(Vec::new()),
            total_registered: AtomicU64::new(0),
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    pub fn max_apps(&self) -> usize {
        self.max_apps
    }

    /// Add a callback fired after every successful disconnect.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(AppId) + Send + Sync + 'static,
    {
        lock(&self.on_disconnect).push(Arc::new(callback));
    }

    // ────────────────────────────────────────────────────────────────────────
    // Membership
    // ────────────────────────────────────────────────────────────────────────

    /// Register a new application in state [`AppState::Registered`].
    ///
    /// # Errors
    ///
    /// * [`CoreError::CapacityExceeded`] when `max_apps` records exist.
    /// * [`CoreError::DuplicateName`] when a record with the same name exists
    ///   and is not disconnected.
    pub fn register(
        &self,
        name: &str,
        version: &str,
        capabilities: Capabilities,
        metadata: Metadata,
    ) -> Result<AppRecord, CoreError> {
        let mut apps = lock(&self.apps);
        if apps.len() >= self.max_apps {
            return Err(CoreError::CapacityExceeded { max: self.max_apps });
        }
        if apps
            .iter()
            .any(|a| a.name == name && a.state != AppState::Disconnected)
        {
            return Err(CoreError::DuplicateName(name.to_string()));
        }

        let now = Utc::now();
        let record = AppRecord {
            id: AppId::new(),
            name: name.to_string(),
            version: version.to_string(),
            state: AppState::Registered,
            capabilities,
            topics: Vec::new(),
            registered_at: now,
            last_heartbeat: now,
            metadata,
        };
        apps.push(record.clone());
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        info!(app_id = %record.id, name, version, "app registered");
        Ok(record)
    }

    /// Remove a record entirely. Returns `false` for unknown ids.
    pub fn unregister(&self, app_id: AppId) -> bool {
        let mut apps = lock(&self.apps);
        match apps.iter().position(|a| a.id == app_id) {
            Some(index) => {
                let removed = apps.remove(index);
                info!(app_id = %app_id, name = %removed.name, "app unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove every disconnected record and return how many went.
    pub fn remove_disconnected(&self) -> usize {
        let mut apps = lock(&self.apps);
        let before = apps.len();
        apps.retain(|a| a.state != AppState::Disconnected);
        let removed = before - apps.len();
        if removed > 0 {
            info!(removed, "disconnected apps removed");
        }
        removed
    }

    // ────────────────────────────────────────────────────────────────────────
    // State transitions
    // ────────────────────────────────────────────────────────────────────────

    /// Mark an app connected and refresh its heartbeat.
    pub fn connect(&self, app_id: AppId) -> bool {
        self.with_record(app_id, |record| {
            record.state = AppState::Connected;
            record.last_heartbeat = Utc::now();
        })
        .inspect(|_| debug!(app_id = %app_id, "app connected"))
        .is_some()
    }

    /// Mark an app disconnected and fire the disconnect callbacks.
    ///
    /// Disconnecting an already-disconnected app returns `true` without
    /// firing the callbacks again.
    pub fn disconnect(&self, app_id: AppId) -> bool {
        let transitioned = match self.with_record(app_id, |record| {
            let was = record.state;
            record.state = AppState::Disconnected;
            was != AppState::Disconnected
        }) {
            Some(transitioned) => transitioned,
            None => return false,
        };

        if transitioned {
            info!(app_id = %app_id, "app disconnected");
            let callbacks: Vec<DisconnectCallback> = lock(&self.on_disconnect).clone();
            for callback in callbacks {
                callback(app_id);
            }
        }
        true
    }

    /// Record a heartbeat. A record that was only `registered` becomes
    /// `connected`; other states are left alone.
    pub fn heartbeat(&self, app_id: AppId) -> bool {
        self.with_record(app_id, |record| {
            record.last_heartbeat = Utc::now();
            if record.state == AppState::Registered {
                record.state = AppState::Connected;
            }
        })
        .is_some()
    }

    /// Administrative hold.
    pub fn suspend(&self, app_id: AppId) -> bool {
        self.with_record(app_id, |record| record.state = AppState::Suspended)
            .inspect(|_| info!(app_id = %app_id, "app suspended"))
            .is_some()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Subscribed-topic bookkeeping (kept in step with the router)
    // ────────────────────────────────────────────────────────────────────────

    pub fn add_topic(&self, app_id: AppId, topic: &str) -> bool {
        self.with_record(app_id, |record| record.topics.push(topic.to_string()))
            .is_some()
    }

    /// Drop one occurrence of `topic` from the app's list.
    pub fn remove_topic(&self, app_id: AppId, topic: &str) -> bool {
        self.with_record(app_id, |record| {
            match record.topics.iter().position(|t| t == topic) {
                Some(index) => {
                    record.topics.remove(index);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    pub fn clear_topics(&self, app_id: AppId) -> bool {
        self.with_record(app_id, |record| record.topics.clear()).is_some()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────────────

    pub fn get(&self, app_id: AppId) -> Option<AppRecord> {
        lock(&self.apps).iter().find(|a| a.id == app_id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<AppRecord> {
        lock(&self.apps).iter().find(|a| a.name == name).cloned()
    }

    /// Every record, in registration order.
    pub fn list(&self) -> Vec<AppRecord> {
        lock(&self.apps).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.apps).len()
    }

    pub fn count_by_state(&self) -> BTreeMap<AppState, usize> {
        let mut counts = BTreeMap::new();
        for app in lock(&self.apps).iter() {
            *counts.entry(app.state).or_insert(0) += 1;
        }
        counts
    }

    /// Number of registrations ever accepted.
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<AppRecord> {
        self.filtered(|a| a.has_capability(capability))
    }

    pub fn find_by_state(&self, state: AppState) -> Vec<AppRecord> {
        self.filtered(|a| a.state == state)
    }

    /// Apps with at least one subscribed pattern matching `topic`.
    pub fn get_subscribers(&self, topic: &str) -> Vec<AppRecord> {
        self.filtered(|a| {
            a.topics
                .iter()
                .filter_map(|t| TopicPattern::parse(t).ok())
                .any(|p| p.matches(topic))
        })
    }

    /// Connected apps whose last heartbeat is older than `threshold`.
    pub fn stale(&self, threshold: Duration) -> Vec<AppRecord> {
        let now = Utc::now();
        self.filtered(|a| {
            a.state == AppState::Connected
                && (now - a.last_heartbeat)
                    .to_std()
                    .map(|age| age > threshold)
                    .unwrap_or(false)
        })
    }

    // ────────────────────────────────────────────────────────────────────────
    // Internal helpers
    // ────────────────────────────────────────────────────────────────────────

    fn with_record<R>(&self, app_id: AppId, f: impl FnOnce(&mut AppRecord) -> R) -> Option<R> {
        lock(&self.apps).iter_mut().find(|a| a.id == app_id).map(f)
    }

    fn filtered(&self, predicate: impl Fn(&AppRecord) -> bool) -> Vec<AppRecord> {
        lock(&self.apps).iter().filter(|a| predicate(a)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn register(registry: &Registry, name: &str) -> AppRecord {
        registry
            .register(name, "0.1.0", Capabilities::new(), Metadata::new())
            .unwrap()
    }

    #[test]
    fn register_then_unregister_restores_count() {
        let registry = Registry::new(10);
        register(&registry, "existing");
        let before = registry.count();

        let app = register(&registry, "transient");
        assert!(registry.unregister(app.id));
        assert_eq!(registry.count(), before);
        assert!(!registry.unregister(app.id));
    }

    #[test]
    fn capacity_is_enforced_at_register() {
        let registry = Registry::new(1);
        let x = register(&registry, "X");
        let err = registry
            .register("Y", "1", Capabilities::new(), Metadata::new())
            .unwrap_err();
        assert_eq!(err, CoreError::CapacityExceeded { max: 1 });

        registry.unregister(x.id);
        assert!(registry.register("Y", "1", Capabilities::new(), Metadata::new()).is_ok());
    }

    #[test]
    fn duplicate_active_name_is_rejected_until_disconnected() {
        let registry = Registry::new(10);
        let first = register(&registry, "mixer");
        let err = registry
            .register("mixer", "2", Capabilities::new(), Metadata::new())
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName(name) if name == "mixer"));

        registry.disconnect(first.id);
        let second = register(&registry, "mixer");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn heartbeat_promotes_registered_to_connected_once() {
        let registry = Registry::new(10);
        let app = register(&registry, "worker");
        assert_eq!(app.state, AppState::Registered);

        assert!(registry.heartbeat(app.id));
        assert_eq!(registry.get(app.id).unwrap().state, AppState::Connected);

        assert!(registry.heartbeat(app.id));
        assert_eq!(registry.get(app.id).unwrap().state, AppState::Connected);
    }

    #[test]
    fn heartbeat_does_not_revive_suspended_app() {
        let registry = Registry::new(10);
        let app = register(&registry, "worker");
        registry.suspend(app.id);
        registry.heartbeat(app.id);
        assert_eq!(registry.get(app.id).unwrap().state, AppState::Suspended);
    }

    #[test]
    fn unknown_ids_return_false() {
        let registry = Registry::new(10);
        let ghost = AppId::new();
        assert!(!registry.heartbeat(ghost));
        assert!(!registry.connect(ghost));
        assert!(!registry.disconnect(ghost));
        assert!(!registry.suspend(ghost));
    }

    #[test]
    fn disconnect_fires_callbacks_once() {
        let registry = Registry::new(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        registry.on_disconnect(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let app = register(&registry, "viewer");
        registry.connect(app.id);
        assert!(registry.disconnect(app.id));
        assert!(registry.disconnect(app.id));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(app.id).unwrap().state, AppState::Disconnected);
    }

    #[test]
    fn queries_filter_by_capability_and_state() {
        let registry = Registry::new(10);
        let caps: Capabilities = ["render".to_string()].into_iter().collect();
        let renderer = registry
            .register("renderer", "1", caps, Metadata::new())
            .unwrap();
        let other = register(&registry, "other");
        registry.connect(other.id);

        let found = registry.find_by_capability("render");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, renderer.id);

        assert_eq!(registry.find_by_state(AppState::Connected).len(), 1);
        assert_eq!(registry.find_by_state(AppState::Registered).len(), 1);
        assert_eq!(registry.count_by_state()[&AppState::Connected], 1);
    }

    #[test]
    fn get_subscribers_uses_pattern_matching() {
        let registry = Registry::new(10);
        let a = register(&registry, "a");
        let b = register(&registry, "b");
        registry.add_topic(a.id, "scene.*");
        registry.add_topic(b.id, "shot.ready");

        let subs = registry.get_subscribers("scene.ready");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, a.id);
        assert!(registry.get_subscribers("scenery").is_empty());

        assert!(registry.remove_topic(a.id, "scene.*"));
        assert!(!registry.remove_topic(a.id, "scene.*"));
        assert!(registry.get_subscribers("scene.ready").is_empty());
    }

    #[test]
    fn remove_disconnected_only_removes_disconnected() {
        let registry = Registry::new(20);
        for n in 0..3 {
            let app = register(&registry, &format!("gone-{n}"));
            registry.disconnect(app.id);
        }
        register(&registry, "alive");

        assert_eq!(registry.remove_disconnected(), 3);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.remove_disconnected(), 0);
        assert_eq!(registry.total_registered(), 4);
    }

    #[test]
    fn stale_reports_only_silent_connected_apps() {
        let registry = Registry::new(10);
        let app = register(&registry, "quiet");
        registry.connect(app.id);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(registry.stale(Duration::from_millis(10)).len(), 1);
        assert!(registry.stale(Duration::from_secs(60)).is_empty());

        registry.heartbeat(app.id);
        assert!(registry.stale(Duration::from_millis(10)).is_empty());
    }
}
