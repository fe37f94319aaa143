//! `corelink-kernel` – Coordination & Supervision
//!
//! The daemon side of CoreLink. It does not run application logic; it keeps
//! track of who is connected, routes their events and keeps itself healthy.
//!
//! # Modules
//!
//! - [`registry`] – [`Registry`][registry::Registry]: the capacity-bounded
//!   catalogue of application records and their lifecycle
//!   (`registered → connected → disconnected`), with capability and topic
//!   lookups.
//! - [`health`] – [`HealthMonitor`][health::HealthMonitor]: independent
//!   probes over the daemon, registry and router, a bounded report history
//!   and known-safe remediation.
//! - [`daemon`] – [`Kernel`][daemon::Kernel]: owns the components, runs the
//!   start/stop lifecycle, the periodic health loop and the runtime snapshot.
//! - [`config`] – [`KernelConfig`][config::KernelConfig]: the kernel tunables.
//! - [`memory_bridge`] – [`MemoryBridge`][memory_bridge::MemoryBridge]: the
//!   seam to an optional external memory collaborator.

pub mod config;
pub mod daemon;
pub mod health;
pub mod memory_bridge;
pub mod registry;

pub use config::KernelConfig;
pub use daemon::{
    Kernel, KernelStatus, LifecycleCallback, SNAPSHOT_FILE, default_kernel, load_snapshot, set_default_kernel,
    snapshot_path,
};
pub use health::{HealReport, HealthConfig, HealthMonitor, RuntimeHealth};
pub use memory_bridge::MemoryBridge;
pub use registry::{DisconnectCallback, Registry};
