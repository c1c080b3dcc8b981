// src/runtime/mod.rs
//! Sandboxed execution runtime
//!
//! This module provides the isolated engines tasks run on:
//!
//! - **Filesystem**: atomic, workspace-confined file operations
//! - **Process**: allow-listed commands in their own process group
//! - **Wasm**: fuel- and memory-bounded WebAssembly
//! - **MicroVM**: pooled isolated instances for interpreted code
//! - **Resource Governor**: per-session quotas shared by all engines
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Engines (contract.rs)                    │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐ │
//! │  │ Filesystem │ │  Process   │ │    Wasm    │ │  MicroVM   │ │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ │
//! │        │              │              │              │        │
//! │        │         sandbox policy      │          VM pool      │
//! │        │              │              │       (per-image      │
//! │        │              └──── output ──┼────────  buckets)     │
//! │        └─────────── workspace ───────┘                       │
//! │                          │                                   │
//! │                 Resource Governor                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod contract;
pub mod filesystem;
pub mod micro_vm;
pub mod output;
pub mod process_manager;
pub mod resource_limiter;
pub mod sandbox;
pub mod vm_pool;
pub mod wasm;
pub mod workspace;

// Re-export commonly used types
pub use contract::{
    CancellationStrategy, EngineKind, EngineOp, EngineOutput, Engines, ExecutionContract,
    ExecutionResult, ExecutionStatus, InvocationContext, Payload, SessionContext,
};
pub use filesystem::{FilesystemEngine, FsOp, FsOutput};
pub use micro_vm::{MicroOp, MicroOutput, MicroVmEngine, ProcessVmBackend, VmBackend};
pub use process_manager::{ProcessEngine, ProcessRequest};
pub use resource_limiter::{ResourceGovernor, ResourceLimits, ResourceUsage};
pub use sandbox::SandboxPolicy;
pub use vm_pool::{PoolStats, VmInfo, VmPool};
pub use wasm::{WasmEngine, WasmOp, WasmOutput, WasmValue};
pub use workspace::Workspace;
