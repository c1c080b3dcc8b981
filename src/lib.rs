// src/lib.rs
//! Sandbox Engine Library
//!
//! Isolated execution of filesystem, process, WebAssembly, and micro-VM
//! operations inside per-project workspaces, scheduled by a task dispatcher.
//!
//! # Architecture
//!
//! - **runtime**: the four engines, workspace confinement, the VM pool, and
//!   the resource governor behind one execution contract
//! - **dispatcher**: task lifecycle, worker pool, per-resource ordering,
//!   watchdog, retries, history
//! - **events**: broadcast bus for task output and state transitions
//! - **agent**: LLM-backed agent tasks with budget-ledger accounting
//! - **gateway**: authenticated JSON-lines RPC front end
//! - **observability**: tracing setup, metric descriptions, telemetry sink
//! - **utils**: configuration, errors, backoff

pub mod agent;
pub mod dispatcher;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod runtime;
pub mod utils;

pub use dispatcher::{Dispatcher, TaskId, TaskSnapshot, TaskSpec, TaskState};
pub use events::{EventBus, TaskEvent};
pub use runtime::contract::{EngineOp, EngineOutput, Engines, SessionContext};
pub use runtime::resource_limiter::ResourceGovernor;
pub use runtime::workspace::Workspace;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, ErrorCode, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: VERSION,
        }
    }
}
