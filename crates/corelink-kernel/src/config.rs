//! [`KernelConfig`] – the plain configuration values an embedding process
//! hands to the kernel.

use std::path::PathBuf;
use std::time::Duration;

use corelink_middleware::DeliveryMode;
use corelink_types::CoreError;
use serde::{Deserialize, Serialize};

/// Kernel tunables. Durations are stored in milliseconds so the struct can be
/// embedded directly in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Maximum number of live application records.
    #[serde(default = "default_max_apps")]
    pub max_apps: usize,

    /// Bound of the queued-delivery channel; also the reference for the
    /// backlog probe.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Runs the periodic health loop and remediates after unhealthy checks.
    #[serde(default = "default_auto_heal")]
    pub auto_heal: bool,

    /// More disconnected records than this raises a warning.
    #[serde(default = "default_disconnected_threshold")]
    pub disconnected_threshold: usize,

    /// Connected apps silent for longer than this are reported as stale.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Number of health reports kept in the rolling history.
    #[serde(default = "default_health_history")]
    pub health_history: usize,

    /// Where the runtime snapshot is written. `None` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

fn default_max_apps() -> usize {
    100
}
fn default_event_queue_capacity() -> usize {
    1000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_auto_heal() -> bool {
    true
}
fn default_disconnected_threshold() -> usize {
    10
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_health_history() -> usize {
    100
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_apps: default_max_apps(),
            event_queue_capacity: default_event_queue_capacity(),
            delivery_mode: DeliveryMode::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            auto_heal: default_auto_heal(),
            disconnected_threshold: default_disconnected_threshold(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            health_history: default_health_history(),
            state_dir: None,
        }
    }
}

impl KernelConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Reject values the kernel cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_apps == 0 {
            return Err(CoreError::Config("max_apps must be at least 1".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(CoreError::Config("event_queue_capacity must be at least 1".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(CoreError::Config("health_check_interval_ms must be positive".into()));
        }
        if self.health_history == 0 {
            return Err(CoreError::Config("health_history must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.max_apps, 100);
        assert_eq!(cfg.event_queue_capacity, 1000);
        assert_eq!(cfg.health_check_interval(), Duration::from_secs(30));
        assert!(cfg.auto_heal);
        assert_eq!(cfg.disconnected_threshold, 10);
        assert_eq!(cfg.health_history, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let cfg = KernelConfig {
            max_apps: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));

        let cfg = KernelConfig {
            event_queue_capacity: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: KernelConfig = serde_json::from_str(r#"{"max_apps": 5, "delivery_mode": "queued"}"#).unwrap();
        assert_eq!(cfg.max_apps, 5);
        assert_eq!(cfg.delivery_mode, DeliveryMode::Queued);
        assert_eq!(cfg.health_check_interval_ms, 30_000);
        assert!(cfg.state_dir.is_none());
    }
}
