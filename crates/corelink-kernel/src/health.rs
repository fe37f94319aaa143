//! [`HealthMonitor`] – point-in-time health checks and known-safe remediation.
//!
//! [`HealthMonitor::check`] runs a fixed sequence of independent probes and
//! folds their [`HealthIssue`]s into a [`RuntimeHealth`] report:
//!
//! | Probe | Severity | Remediation |
//! |---|---|---|
//! | daemon not `running` | `CRITICAL` | `restart_daemon` (always fails in-process) |
//! | disconnected records above threshold | `WARNING` | `cleanup_disconnected` |
//! | queued backlog above 80% of capacity | `WARNING` | none |
//! | connected apps with stale heartbeats | `WARNING` | none |
//!
//! The monitor holds only weak references to the registry and router; a
//! probe whose dependency is gone is skipped for that cycle.
//!
//! [`HealthMonitor::heal`] applies the bound action of every unresolved,
//! auto-remediable issue from the latest report. It never retries; the
//! kernel's periodic loop decides when to call it again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corelink_middleware::{DeliveryMode, Router};
use corelink_types::{
    AppState, HealthIssue, HealthStatus, LifecycleState, RemediationAction, RuntimeState, Severity,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::registry::Registry;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Component names used on issues.
pub const COMPONENT_DAEMON: &str = "daemon";
pub const COMPONENT_REGISTRY: &str = "registry";
pub const COMPONENT_ROUTER: &str = "router";

/// Probe thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub disconnected_threshold: usize,
    pub heartbeat_timeout: Duration,
    /// Number of reports kept in the rolling history (at least 1).
    pub history_limit: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disconnected_threshold: 10,
            heartbeat_timeout: Duration::from_secs(30),
            history_limit: 100,
        }
    }
}

/// Result of one [`HealthMonitor::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeHealth {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub checked_at: DateTime<Utc>,
}

impl RuntimeHealth {
    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn unresolved(&self) -> usize {
        self.issues.iter().filter(|i| !i.is_resolved()).count()
    }

    pub fn issues_for(&self, component: &str) -> impl Iterator<Item = &HealthIssue> {
        self.issues.iter().filter(move |i| i.component == component)
    }
}

/// Outcome of one [`HealthMonitor::heal`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealReport {
    pub fixed: Vec<HealthIssue>,
    pub failed: Vec<HealthIssue>,
    /// Issues of the latest report still unresolved afterwards.
    pub remaining: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// HealthMonitor
// ────────────────────────────────────────────────────────────────────────────

pub struct HealthMonitor {
    config: HealthConfig,
    registry: Weak<Registry>,
    router: Weak<Router>,
    runtime: Arc<RwLock<RuntimeState>>,
    history: Mutex<VecDeque<RuntimeHealth>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HealthMonitor {
    /// Bind a monitor to the kernel's runtime state and its components.
    pub fn new(
        config: HealthConfig,
        registry: Weak<Registry>,
        router: Weak<Router>,
        runtime: Arc<RwLock<RuntimeState>>,
    ) -> Self {
        let config = HealthConfig {
            history_limit: config.history_limit.max(1),
            ..config
        };
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_limit)),
            config,
            registry,
            router,
            runtime,
        }
    }

    /// Run every probe and record the report in the history.
    pub fn check(&self) -> RuntimeHealth {
        let mut issues = Vec::new();

        self.probe_daemon(&mut issues);
        match self.registry.upgrade() {
            Some(registry) => {
                self.probe_disconnected(&registry, &mut issues);
                self.probe_stale(&registry, &mut issues);
            }
            None => debug!("registry unavailable; registry probes skipped"),
        }
        match self.router.upgrade() {
            Some(router) => self.probe_backlog(&router, &mut issues),
            None => debug!("router unavailable; backlog probe skipped"),
        }

        let report = RuntimeHealth {
            status: HealthStatus::from_issues(&issues),
            issues,
            checked_at: Utc::now(),
        };

        {
            let mut history = lock(&self.history);
            history.push_back(report.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        if let Ok(mut runtime) = self.runtime.write() {
            runtime.last_health_check = Some(report.checked_at);
        }

        if report.is_healthy() {
            debug!("health check passed");
        } else {
            info!(status = %report.status, issues = report.issues.len(), "health check found issues");
        }
        report
    }

    /// Apply the bound remediation of every unresolved, auto-remediable issue
    /// in the latest report.
    pub fn heal(&self) -> HealReport {
        let mut history = lock(&self.history);
        let Some(latest) = history.back_mut() else {
            return HealReport::default();
        };

        let mut outcome = HealReport::default();
        for issue in latest
            .issues
            .iter_mut()
            .filter(|i| i.auto_remediable && !i.is_resolved())
        {
            match issue.action {
                RemediationAction::CleanupDisconnected => match self.registry.upgrade() {
                    Some(registry) => {
                        let removed = registry.remove_disconnected();
                        issue.resolve();
                        info!(removed, "remediation cleanup_disconnected applied");
                        outcome.fixed.push(issue.clone());
                    }
                    None => {
                        warn!("remediation cleanup_disconnected failed: registry unavailable");
                        outcome.failed.push(issue.clone());
                    }
                },
                RemediationAction::RestartDaemon => {
                    warn!("remediation restart_daemon needs an external supervisor");
                    outcome.failed.push(issue.clone());
                }
                RemediationAction::None => {}
            }
        }
        outcome.remaining = latest.unresolved();
        outcome
    }

    pub fn last_report(&self) -> Option<RuntimeHealth> {
        lock(&self.history).back().cloned()
    }

    /// Every retained report, oldest first.
    pub fn history(&self) -> Vec<RuntimeHealth> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Probes
    // ────────────────────────────────────────────────────────────────────────

    fn probe_daemon(&self, issues: &mut Vec<HealthIssue>) {
        let state = match self.runtime.read() {
            Ok(runtime) => runtime.state,
            Err(_) => return,
        };
        if state != LifecycleState::Running {
            issues.push(
                HealthIssue::new(
                    COMPONENT_DAEMON,
                    Severity::Critical,
                    format!("kernel is {state}, expected running"),
                )
                .remediable(RemediationAction::RestartDaemon),
            );
        }
    }

    fn probe_disconnected(&self, registry: &Registry, issues: &mut Vec<HealthIssue>) {
        let disconnected = registry.find_by_state(AppState::Disconnected).len();
        if disconnected > self.config.disconnected_threshold {
            issues.push(
                HealthIssue::new(
                    COMPONENT_REGISTRY,
                    Severity::Warning,
                    format!(
                        "{disconnected} disconnected apps (threshold {})",
                        self.config.disconnected_threshold
                    ),
                )
                .remediable(RemediationAction::CleanupDisconnected),
            );
        }
    }

    fn probe_stale(&self, registry: &Registry, issues: &mut Vec<HealthIssue>) {
        let stale = registry.stale(self.config.heartbeat_timeout);
        if !stale.is_empty() {
            let names: Vec<&str> = stale.iter().map(|a| a.name.as_str()).collect();
            issues.push(HealthIssue::new(
                COMPONENT_REGISTRY,
                Severity::Warning,
                format!("no heartbeat within {:?} from: {}", self.config.heartbeat_timeout, names.join(", ")),
            ));
        }
    }

    fn probe_backlog(&self, router: &Router, issues: &mut Vec<HealthIssue>) {
        if router.mode() != DeliveryMode::Queued {
            return;
        }
        let pending = router.pending();
        let capacity = router.capacity();
        // pending > 80% of capacity
        if pending * 5 > capacity * 4 {
            issues.push(HealthIssue::new(
                COMPONENT_ROUTER,
                Severity::Warning,
                format!("{pending} events pending of {capacity} capacity"),
            ));
        }
    }
}
