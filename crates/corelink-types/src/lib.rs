use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Free-form key/value metadata attached to apps, events and health issues.
pub type Metadata = BTreeMap<String, Value>;

/// Capability tags advertised by a registered application.
pub type Capabilities = BTreeSet<String>;

/// Metadata key under which a request event carries its response topic.
pub const REPLY_TO_KEY: &str = "reply_to";

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Registry-assigned application identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(Uuid);

impl AppId {
    /// Source id used for events emitted by the kernel itself.
    pub const SYSTEM: AppId = AppId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AppId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Router-assigned subscription identifier. Monotonic per router, so ordering
/// by id is ordering by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Applications
// ─────────────────────────────────────────────────────────────────────────────

/// Connection state of a registered application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Registered,
    Connected,
    Disconnected,
    /// Administrative hold. Never applied automatically.
    Suspended,
    /// Reserved; no kernel operation sets it.
    Error,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Registered => "registered",
            AppState::Connected => "connected",
            AppState::Disconnected => "disconnected",
            AppState::Suspended => "suspended",
            AppState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One registered application as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    pub name: String,
    pub version: String,
    pub state: AppState,
    pub capabilities: Capabilities,
    /// Topic patterns this app currently subscribes to.
    pub topics: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Metadata,
}

impl AppRecord {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Topics
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed subscription pattern.
///
/// | Pattern | Matches |
/// |---|---|
/// | `*` | every topic |
/// | `scene.*` | any topic starting with `scene.` (not `scene`, not `scenery`) |
/// | `scene.ready` | exactly `scene.ready` |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    All,
    /// Stores the prefix including the trailing dot.
    Prefix(String),
    Exact(String),
}

impl TopicPattern {
    /// Parse a subscription pattern. Empty patterns are rejected.
    pub fn parse(pattern: &str) -> Result<Self, CoreError> {
        if pattern.is_empty() {
            return Err(CoreError::InvalidTopic(pattern.to_string()));
        }
        if pattern == "*" {
            return Ok(TopicPattern::All);
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) if !prefix.is_empty() => Ok(TopicPattern::Prefix(format!("{prefix}."))),
            Some(_) => Err(CoreError::InvalidTopic(pattern.to_string())),
            None => Ok(TopicPattern::Exact(pattern.to_string())),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Prefix(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => exact == topic,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        !matches!(self, TopicPattern::Exact(_))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::All => f.write_str("*"),
            TopicPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            TopicPattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// Validate a concrete (publish-side) topic.
pub fn validate_topic(topic: &str) -> Result<(), CoreError> {
    if topic.trim().is_empty() {
        Err(CoreError::InvalidTopic(topic.to_string()))
    } else {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Informational priority carried on an event. The router never reorders by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A single published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub source: AppId,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Value, source: AppId) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            source,
            priority: Priority::default(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Response topic of a request event, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.metadata.get(REPLY_TO_KEY).and_then(Value::as_str)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Named recovery procedure bound to a health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Remove every disconnected record from the registry.
    CleanupDisconnected,
    /// Needs an external supervisor; always fails in-process.
    RestartDaemon,
    None,
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemediationAction::CleanupDisconnected => "cleanup_disconnected",
            RemediationAction::RestartDaemon => "restart_daemon",
            RemediationAction::None => "none",
        };
        f.write_str(s)
    }
}

/// One problem detected by a health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub id: Uuid,
    pub component: String,
    pub severity: Severity,
    pub message: String,
    pub auto_remediable: bool,
    pub action: RemediationAction,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HealthIssue {
    /// A report-only issue with no remediation bound to it.
    pub fn new(component: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            component: component.into(),
            severity,
            message: message.into(),
            auto_remediable: false,
            action: RemediationAction::None,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Bind `action` and mark the issue auto-remediable.
    pub fn remediable(mut self, action: RemediationAction) -> Self {
        self.auto_remediable = action != RemediationAction::None;
        self.action = action;
        self
    }

    pub fn resolve(&mut self) {
        self.resolved_at = Some(Utc::now());
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Overall health derived from the worst issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn from_issues(issues: &[HealthIssue]) -> Self {
        match issues.iter().map(|i| i.severity).max() {
            None => HealthStatus::Healthy,
            Some(Severity::Warning) => HealthStatus::Degraded,
            Some(Severity::Error) => HealthStatus::Unhealthy,
            Some(Severity::Critical) => HealthStatus::Critical,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Kernel-owned runtime state; also the on-disk snapshot format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub daemon_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub state: LifecycleState,
    pub apps_registered: u64,
    pub events_processed: u64,
    pub errors: u64,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            daemon_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: LifecycleState::Stopped,
            apps_registered: 0,
            events_processed: 0,
            errors: 0,
            last_health_check: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type for registry, routing, connector and lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoreError {
    #[error("Registry full: at most {max} applications may be registered")]
    CapacityExceeded { max: usize },

    #[error("An active application named '{0}' is already registered")]
    DuplicateName(String),

    #[error("Unknown application: {0}")]
    UnknownApp(AppId),

    #[error("Connector is not connected")]
    NotConnected,

    #[error("Connector is already connected")]
    AlreadyConnected,

    #[error("Kernel is not running")]
    KernelNotRunning,

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Request on '{topic}' timed out after {timeout_ms} ms")]
    Timeout { topic: String, timeout_ms: u64 },

    #[error("Invalid topic: '{0}'")]
    InvalidTopic(String),

    #[error("Event queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Event has no reply_to topic")]
    MissingReplyTo,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Memory bridge error: {0}")]
    Memory(String),

    #[error("A {0} callback panicked")]
    CallbackPanicked(String),
}
