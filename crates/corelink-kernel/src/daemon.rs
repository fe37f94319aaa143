//! [`Kernel`] – lifecycle owner and single entry point of the runtime.
//!
//! ```text
//! stopped ──start──▶ starting ──▶ running ──stop──▶ stopping ──▶ stopped
//!    ▲                  │                              │
//!    └────start──── error ◀──────── fault ─────────────┘
//! ```
//!
//! A cold [`Kernel::start`] builds the [`Registry`], [`Router`] and
//! [`HealthMonitor`], launches the background tasks (queued delivery in
//! queued mode, the health loop when auto-heal is enabled), runs the start
//! callbacks and writes a best-effort JSON snapshot of the [`RuntimeState`].
//! [`Kernel::stop`] cancels every background task and awaits it before the
//! stop callbacks run and the final snapshot is written.
//!
//! # Example
//!
//! ```rust,no_run
//! use corelink_kernel::{Kernel, KernelConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let kernel = Kernel::new(KernelConfig::default());
//!     kernel.start().await.expect("kernel failed to start");
//!     println!("{:?}", kernel.status().runtime.state);
//!     kernel.stop().await.expect("kernel failed to stop");
//! }
//! ```

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use corelink_middleware::{Router, RouterStats};
use corelink_types::{AppState, CoreError, HealthStatus, LifecycleState, Metadata, RuntimeState};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::health::{HealReport, HealthConfig, HealthMonitor, RuntimeHealth};
use crate::memory_bridge::MemoryBridge;
use crate::registry::Registry;

/// File name of the runtime snapshot inside the configured state directory.
pub const SNAPSHOT_FILE: &str = "runtime_state.json";

/// Callback run on start or stop, in registration order.
pub type LifecycleCallback = Box<dyn Fn() + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view for CLIs and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub runtime: RuntimeState,
    pub apps_total: usize,
    pub apps_by_state: BTreeMap<AppState, usize>,
    pub router: RouterStats,
    pub queue_capacity: usize,
    pub health: Option<HealthStatus>,
    pub unresolved_issues: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Components {
    registry: Arc<Registry>,
    router: Arc<Router>,
    health: Arc<HealthMonitor>,
}

struct BackgroundTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The coordination daemon. Share it behind an [`Arc`] when several tasks
/// need it.
pub struct Kernel {
    config: KernelConfig,
    runtime: Arc<RwLock<RuntimeState>>,
    components: RwLock<Option<Components>>,
    tasks: Mutex<Vec<BackgroundTask>>,
    /// Faults caught by the health loop and task shutdown.
    errors: Arc<AtomicU64>,
    start_callbacks: Mutex<Vec<LifecycleCallback>>,
    stop_callbacks: Mutex<Vec<LifecycleCallback>>,
    memory: Option<Arc<dyn MemoryBridge>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Kernel {
    /// Create a stopped kernel. Nothing is allocated until [`Kernel::start`].
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            runtime: Arc::new(RwLock::new(RuntimeState::default())),
            components: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            errors: Arc::new(AtomicU64::new(0)),
            start_callbacks: Mutex::new(Vec::new()),
            stop_callbacks: Mutex::new(Vec::new()),
            memory: None,
        }
    }

    /// Attach the external memory collaborator (builder-style).
    pub fn with_memory_bridge(mut self, bridge: Arc<dyn MemoryBridge>) -> Self {
        self.memory = Some(bridge);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn on_start<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.start_callbacks).push(Box::new(callback));
    }

    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.stop_callbacks).push(Box::new(callback));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the kernel. Calling it while already running is a no-op.
    ///
    /// # Errors
    ///
    /// * [`CoreError::InvalidTransition`] while starting or stopping.
    /// * [`CoreError::Config`] when the configuration is unusable.
    /// * [`CoreError::CallbackPanicked`] when a start callback panics.
    ///
    /// On either failure every background task is shut down and the kernel
    /// is left in [`LifecycleState::Error`].
    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let mut runtime = write(&self.runtime);
            match runtime.state {
                LifecycleState::Running => return Ok(()),
                LifecycleState::Starting | LifecycleState::Stopping => {
                    return Err(CoreError::InvalidTransition {
                        from: runtime.state,
                        to: LifecycleState::Starting,
                    });
                }
                LifecycleState::Stopped | LifecycleState::Error => runtime.state = LifecycleState::Starting,
            }
        }
        info!("kernel starting");

        // Leftovers from a failed run.
        self.shutdown_tasks().await;

        if let Err(e) = self.boot() {
            write(&self.runtime).state = LifecycleState::Error;
            *write(&self.components) = None;
            error!(error = %e, "kernel failed to start");
            return Err(e);
        }

        if let Err(e) = run_callbacks(&self.start_callbacks, "start") {
            self.shutdown_tasks().await;
            self.errors.fetch_add(1, Ordering::Relaxed);
            write(&self.runtime).state = LifecycleState::Error;
            *write(&self.components) = None;
            error!(error = %e, "kernel failed to start");
            return Err(e);
        }

        let daemon_id = {
            let mut runtime = write(&self.runtime);
            runtime.state = LifecycleState::Running;
            runtime.daemon_id
        };
        self.persist_snapshot();
        info!(daemon_id = %daemon_id, "kernel running");
        Ok(())
    }

    /// Stop the kernel. Calling it while already stopped is a no-op.
    ///
    /// # Errors
    ///
    /// * [`CoreError::InvalidTransition`] while starting, stopping, or in the
    ///   error state (only a fresh start is accepted from there).
    /// * [`CoreError::CallbackPanicked`] when a stop callback panics. The
    ///   tasks are already down at that point; the kernel ends in
    ///   [`LifecycleState::Error`].
    pub async fn stop(&self) -> Result<(), CoreError> {
        {
            let mut runtime = write(&self.runtime);
            match runtime.state {
                LifecycleState::Stopped => return Ok(()),
                LifecycleState::Running => runtime.state = LifecycleState::Stopping,
                from => {
                    return Err(CoreError::InvalidTransition {
                        from,
                        to: LifecycleState::Stopping,
                    });
                }
            }
        }
        info!("kernel stopping");

        self.shutdown_tasks().await;

        let callbacks = run_callbacks(&self.stop_callbacks, "stop");
        if callbacks.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        self.refresh_counters();
        write(&self.runtime).state = match callbacks {
            Ok(()) => LifecycleState::Stopped,
            Err(_) => LifecycleState::Error,
        };
        self.persist_snapshot();
        *write(&self.components) = None;
        match callbacks {
            Ok(()) => {
                info!("kernel stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "kernel stopped with a faulty callback");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        read(&self.runtime).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Current runtime state with up-to-date counters.
    pub fn runtime_state(&self) -> RuntimeState {
        self.refresh_counters();
        read(&self.runtime).clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Component access
    // ─────────────────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// [`CoreError::KernelNotRunning`] unless the kernel is running.
    pub fn registry(&self) -> Result<Arc<Registry>, CoreError> {
        self.running_components().map(|c| c.registry)
    }

    /// # Errors
    ///
    /// [`CoreError::KernelNotRunning`] unless the kernel is running.
    pub fn router(&self) -> Result<Arc<Router>, CoreError> {
        self.running_components().map(|c| c.router)
    }

    /// # Errors
    ///
    /// [`CoreError::KernelNotRunning`] unless the kernel is running.
    pub fn health(&self) -> Result<Arc<HealthMonitor>, CoreError> {
        self.running_components().map(|c| c.health)
    }

    /// Run a health check immediately, outside the periodic loop.
    pub fn check_now(&self) -> Result<RuntimeHealth, CoreError> {
        Ok(self.health()?.check())
    }

    /// Apply remediations for the latest health report immediately.
    pub fn heal_now(&self) -> Result<HealReport, CoreError> {
        Ok(self.health()?.heal())
    }

    /// Combined snapshot of runtime state, registry, router and health.
    pub fn status(&self) -> KernelStatus {
        let runtime = self.runtime_state();
        let components = read(&self.components).clone();
        match components {
            Some(c) => {
                let last = c.health.last_report();
                KernelStatus {
                    runtime,
                    apps_total: c.registry.count(),
                    apps_by_state: c.registry.count_by_state(),
                    router: c.router.stats(),
                    queue_capacity: c.router.capacity(),
                    health: last.as_ref().map(|r| r.status),
                    unresolved_issues: last.as_ref().map(RuntimeHealth::unresolved).unwrap_or(0),
                }
            }
            None => KernelStatus {
                runtime,
                apps_total: 0,
                apps_by_state: BTreeMap::new(),
                router: RouterStats::default(),
                queue_capacity: self.config.event_queue_capacity,
                health: None,
                unresolved_issues: 0,
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memory collaborator forwarding
    // ─────────────────────────────────────────────────────────────────────────

    /// Forward to the memory bridge; `Ok(None)` when none is configured.
    pub async fn remember(&self, key: &str, content: Value, metadata: Metadata) -> Result<Option<String>, CoreError> {
        match &self.memory {
            Some(memory) => memory.remember(key, content, metadata).await.map(Some),
            None => Ok(None),
        }
    }

    /// Forward to the memory bridge; empty when none is configured.
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<Value>, CoreError> {
        match &self.memory {
            Some(memory) => memory.recall(query, limit).await,
            None => Ok(Vec::new()),
        }
    }

    /// Forward to the memory bridge; `Ok(0)` when none is configured.
    pub async fn index(&self, documents: Vec<Value>) -> Result<usize, CoreError> {
        match &self.memory {
            Some(memory) => memory.index(documents).await,
            None => Ok(0),
        }
    }

    pub fn has_memory_bridge(&self) -> bool {
        self.memory.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Build every component and launch the background tasks. Nothing is
    /// spawned until every fallible step has passed.
    fn boot(&self) -> Result<(), CoreError> {
        self.config.validate()?;

        let registry = Arc::new(Registry::new(self.config.max_apps));
        let router = Arc::new(Router::new(self.config.delivery_mode, self.config.event_queue_capacity));

        // Disconnect cascades into the router.
        let weak_router = Arc::downgrade(&router);
        registry.on_disconnect(move |app_id| {
            if let Some(router) = weak_router.upgrade() {
                router.unsubscribe_all(app_id);
            }
        });

        let health = Arc::new(HealthMonitor::new(
            HealthConfig {
                disconnected_threshold: self.config.disconnected_threshold,
                heartbeat_timeout: self.config.heartbeat_timeout(),
                history_limit: self.config.health_history,
            },
            Arc::downgrade(&registry),
            Arc::downgrade(&router),
            Arc::clone(&self.runtime),
        ));

        {
            let mut runtime = write(&self.runtime);
            runtime.daemon_id = Uuid::new_v4();
            runtime.started_at = Utc::now();
            runtime.apps_registered = 0;
            runtime.events_processed = 0;
            runtime.errors = 0;
            runtime.last_health_check = None;
        }
        self.errors.store(0, Ordering::Relaxed);

        let mut tasks = lock(&self.tasks);
        let cancel = CancellationToken::new();
        if let Some(handle) = router.spawn_delivery(cancel.clone()) {
            tasks.push(BackgroundTask {
                name: "queued-delivery",
                cancel,
                handle,
            });
        }
        if self.config.auto_heal {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(health_loop(
                Arc::clone(&health),
                self.config.health_check_interval(),
                self.config.auto_heal,
                Arc::clone(&self.errors),
                cancel.clone(),
            ));
            tasks.push(BackgroundTask {
                name: "health-loop",
                cancel,
                handle,
            });
        }
        drop(tasks);

        *write(&self.components) = Some(Components {
            registry,
            router,
            health,
        });
        Ok(())
    }

    /// Cancel every background task and wait for it to finish.
    async fn shutdown_tasks(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.cancel.cancel();
            match task.handle.await {
                Err(e) if !e.is_cancelled() => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(task = task.name, error = %e, "background task ended abnormally");
                }
                _ => {}
            }
        }
    }

    fn running_components(&self) -> Result<Components, CoreError> {
        if !self.is_running() {
            return Err(CoreError::KernelNotRunning);
        }
        read(&self.components).clone().ok_or(CoreError::KernelNotRunning)
    }

    fn refresh_counters(&self) {
        let components = read(&self.components).clone();
        let mut runtime = write(&self.runtime);
        let mut errors = self.errors.load(Ordering::Relaxed);
        if let Some(c) = components {
            let stats = c.router.stats();
            runtime.apps_registered = c.registry.total_registered();
            runtime.events_processed = stats.published;
            errors += stats.handler_errors;
        }
        runtime.errors = errors;
    }

    /// Best-effort write of the runtime snapshot; failures are only logged.
    fn persist_snapshot(&self) {
        let Some(dir) = &self.config.state_dir else {
            return;
        };
        self.refresh_counters();
        let snapshot = read(&self.runtime).clone();
        if let Err(e) = write_snapshot(dir, &snapshot) {
            warn!(dir = %dir.display(), error = %e, "failed to persist runtime snapshot");
        }
    }
}

/// Run callbacks in registration order. A panic stops the sequence.
fn run_callbacks(callbacks: &Mutex<Vec<LifecycleCallback>>, phase: &str) -> Result<(), CoreError> {
    let callbacks = lock(callbacks);
    for callback in callbacks.iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            return Err(CoreError::CallbackPanicked(phase.to_string()));
        }
    }
    Ok(())
}

fn write_snapshot(dir: &Path, snapshot: &RuntimeState) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let raw = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
    std::fs::write(snapshot_path(dir), raw)
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Read the snapshot left by a previous run. `Ok(None)` when absent.
pub fn load_snapshot(dir: &Path) -> Result<Option<RuntimeState>, CoreError> {
    let path = snapshot_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(&path)
        .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| CoreError::Config(format!("failed to parse {}: {e}", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Health loop
// ─────────────────────────────────────────────────────────────────────────────

async fn health_loop(
    health: Arc<HealthMonitor>,
    interval: Duration,
    auto_heal: bool,
    errors: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, "health loop started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        // A faulty probe must not take the loop down with it.
        let cycle = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let report = health.check();
            if !report.is_healthy() && auto_heal {
                let outcome = health.heal();
                if !outcome.failed.is_empty() {
                    warn!(
                        failed = outcome.failed.len(),
                        remaining = outcome.remaining,
                        "automatic remediation incomplete"
                    );
                }
            }
        }));
        if cycle.is_err() {
            errors.fetch_add(1, Ordering::Relaxed);
            error!("health check cycle panicked; continuing");
        }
    }
    info!("health loop stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-wide default
// ─────────────────────────────────────────────────────────────────────────────

static DEFAULT_KERNEL: OnceLock<Arc<Kernel>> = OnceLock::new();

/// Install the process-wide default kernel. Fails (returning the argument)
/// when one is already installed.
pub fn set_default_kernel(kernel: Arc<Kernel>) -> Result<(), Arc<Kernel>> {
    DEFAULT_KERNEL.set(kernel)
}

/// The process-wide default kernel, if one was installed.
pub fn default_kernel() -> Option<Arc<Kernel>> {
    DEFAULT_KERNEL.get().cloned()
}
