// src/events/mod.rs
//! Event/Result bus
//!
//! Streams incremental task output and lifecycle transitions to callers:
//!
//! ```text
//! Engine ──EventPublisher──┐
//! Dispatcher ──────────────┼──→ broadcast channel ──→ subscribers (gateway, tests)
//! ```
//!
//! Engines never hold a reference to the dispatcher; they receive a
//! task-scoped [`EventPublisher`] and push into a channel the dispatcher owns.

pub mod bus;

pub use bus::{BusStats, EventBus, EventKind, EventPublisher, StreamKind, TaskEvent};
