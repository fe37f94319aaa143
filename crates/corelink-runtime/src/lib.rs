//! `corelink-runtime` – Application-side SDK
//!
//! What an application links against to take part in a CoreLink runtime.
//!
//! # Modules
//!
//! - [`connector`] – [`Connector`][connector::Connector]: registers an
//!   application with a running [`Kernel`], routes its subscriptions and
//!   publishes, keeps its heartbeat, and offers request/reply over private
//!   `_reply.*` topics.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter
//!   (enabled by `OTEL_EXPORTER_OTLP_ENDPOINT`).
//!
//! The kernel, router and shared types are re-exported so an application can
//! depend on this crate alone.

pub mod connector;
pub mod telemetry;

pub use connector::{ConnectionHandle, Connector, DEFAULT_HEARTBEAT_INTERVAL, REPLY_TOPIC_PREFIX};
pub use corelink_kernel::{Kernel, KernelConfig, KernelStatus};
pub use corelink_middleware::{DeliveryMode, EventFilter, EventHandler, HandlerResult, filter, handler};
pub use corelink_types::{AppId, CoreError, Event, Metadata, Priority, SubscriptionId};
pub use telemetry::{TracerProviderGuard, init_tracing};
