//! `corelink-middleware` – The Router
//!
//! Routes published events to every subscription whose topic pattern matches,
//! without caring about the payload's meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe router with exact, `prefix.*`
//!   and `*` patterns, inline or queued delivery, and per-handler failure
//!   isolation.

pub mod bus;

pub use bus::{DeliveryMode, EventFilter, EventHandler, HandlerResult, Router, RouterStats, filter, handler};
