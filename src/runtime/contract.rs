// src/runtime/contract.rs
//! Execution contract shared by all engines
//!
//! The set of engines is closed: an operation is an [`EngineOp`] variant and
//! [`Engines::invoke`] matches it explicitly to the backend that owns it.
//! Adding an engine means adding a variant, not registering a name.
//!
//! ```text
//! EngineOp::Filesystem ──→ FilesystemEngine   (blocking I/O off the async path)
//! EngineOp::Process    ──→ ProcessEngine      (forceful cancellation)
//! EngineOp::Wasm       ──→ WasmEngine         (cooperative cancellation)
//! EngineOp::MicroVm    ──→ MicroVmEngine      (forceful cancellation)
//! ```

use crate::dispatcher::task::TaskId;
use crate::events::EventPublisher;
use crate::runtime::filesystem::{FilesystemEngine, FsOp, FsOutput};
use crate::runtime::micro_vm::{MicroOp, MicroOutput, MicroVmEngine, ProcessVmBackend};
use crate::runtime::process_manager::{ProcessEngine, ProcessRequest};
use crate::runtime::resource_limiter::{ResourceGovernor, ResourceLimits, ResourceUsage};
use crate::runtime::wasm::{WasmEngine, WasmOp, WasmOutput};
use crate::runtime::workspace::Workspace;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Engine variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Filesystem,
    Process,
    Wasm,
    MicroVm,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Filesystem => "filesystem",
            EngineKind::Process => "process",
            EngineKind::Wasm => "wasm",
            EngineKind::MicroVm => "micro_vm",
        }
    }
}

/// How an engine reacts to a cancellation signal.
///
/// Either way, the invoke future resolves only once execution has stopped
/// producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationStrategy {
    /// Checked at execution boundaries (wasm fuel yields)
    Cooperative,
    /// Hard termination of the process group / instance
    Forceful,
}

/// Byte payload carried over structured RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data")]
pub enum Payload {
    #[serde(rename = "utf-8")]
    Utf8(String),
    #[serde(rename = "base64")]
    Base64(String),
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Utf8(value.into())
    }

    /// UTF-8 when possible, base64 otherwise
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Payload::Utf8(text),
            Err(err) => Payload::Base64(BASE64.encode(err.into_bytes())),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Payload::Utf8(text) => Ok(text.as_bytes().to_vec()),
            Payload::Base64(encoded) => BASE64.decode(encoded.as_bytes()).map_err(|e| {
                EngineError::InvalidParameters(format!("invalid base64 payload: {}", e))
            }),
        }
    }

    pub fn byte_len(&self) -> Result<usize> {
        match self {
            Payload::Utf8(text) => Ok(text.len()),
            Payload::Base64(_) => self.to_bytes().map(|b| b.len()),
        }
    }
}

/// A session's identity and its resolved workspace
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub session_id: String,
    pub workspace: Workspace,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>, workspace: Workspace) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            workspace,
        }
    }
}

/// A single operation on one engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", content = "request", rename_all = "snake_case")]
pub enum EngineOp {
    Filesystem(FsOp),
    Process(ProcessRequest),
    Wasm(WasmOp),
    MicroVm(MicroOp),
}

impl EngineOp {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineOp::Filesystem(_) => EngineKind::Filesystem,
            EngineOp::Process(_) => EngineKind::Process,
            EngineOp::Wasm(_) => EngineKind::Wasm,
            EngineOp::MicroVm(_) => EngineKind::MicroVm,
        }
    }

    /// RPC-style operation name, e.g. `fs.write`
    pub fn operation_name(&self) -> &'static str {
        match self {
            EngineOp::Filesystem(op) => op.name(),
            EngineOp::Process(_) => "run.exec",
            EngineOp::Wasm(op) => op.name(),
            EngineOp::MicroVm(op) => op.name(),
        }
    }

    /// Structural validation; no filesystem access
    pub fn validate(&self) -> Result<()> {
        match self {
            EngineOp::Filesystem(op) => op.validate(),
            EngineOp::Process(request) => request.validate(),
            EngineOp::Wasm(op) => op.validate(),
            EngineOp::MicroVm(op) => op.validate(),
        }
    }

    /// Keys whose operations must run in submission order
    pub fn resource_keys(&self, workspace: &Workspace) -> Vec<String> {
        match self {
            EngineOp::Filesystem(op) => op.resource_keys(workspace),
            EngineOp::Process(_) => Vec::new(),
            EngineOp::Wasm(op) => op.resource_keys(workspace),
            EngineOp::MicroVm(op) => op.resource_keys(),
        }
    }

    /// Compact description recorded on the task (never the full payload)
    pub fn summary(&self) -> serde_json::Value {
        match self {
            EngineOp::Filesystem(op) => op.summary(),
            EngineOp::Process(request) => request.summary(),
            EngineOp::Wasm(op) => op.summary(),
            EngineOp::MicroVm(op) => op.summary(),
        }
    }
}

/// Terminal status of a process-like execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

/// Output of a process or micro-VM execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(with = "lossy_text")]
    pub stdout: Vec<u8>,
    #[serde(with = "lossy_text")]
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub usage: ResourceUsage,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// What an engine hands back to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", content = "output", rename_all = "snake_case")]
pub enum EngineOutput {
    Filesystem(FsOutput),
    Process(ExecutionResult),
    Wasm(WasmOutput),
    MicroVm(MicroOutput),
}

impl EngineOutput {
    /// The process-like result, if this output carries one
    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            EngineOutput::Process(result) => Some(result),
            EngineOutput::MicroVm(MicroOutput::Executed(result)) => Some(result),
            _ => None,
        }
    }
}

/// Everything an engine may use while running one operation
#[derive(Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub session: SessionContext,
    pub limits: ResourceLimits,
    pub events: EventPublisher,
    pub cancel: CancellationToken,
}

impl InvocationContext {
    /// Context not attached to any dispatcher task
    pub fn detached(session: SessionContext, limits: ResourceLimits) -> Self {
        let task_id = TaskId::new();
        Self {
            task_id,
            session,
            limits,
            events: EventPublisher::detached(task_id),
            cancel: CancellationToken::new(),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.session.workspace
    }
}

/// Uniform operation interface implemented by every engine
#[async_trait]
pub trait ExecutionContract: Send + Sync {
    type Op: Send + 'static;

    fn kind(&self) -> EngineKind;

    fn cancellation(&self) -> CancellationStrategy;

    /// Limit snapshot for `op`, captured at submission
    fn limits_for(
        &self,
        op: &Self::Op,
        session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits>;

    async fn invoke(&self, op: Self::Op, ctx: InvocationContext) -> Result<EngineOutput>;
}

/// The four engines behind one explicit match
#[derive(Clone)]
pub struct Engines {
    pub filesystem: Arc<FilesystemEngine>,
    pub process: Arc<ProcessEngine>,
    pub wasm: Arc<WasmEngine>,
    pub micro: Arc<MicroVmEngine>,
}

impl Engines {
    pub fn from_config(config: &EngineConfig, governor: Arc<ResourceGovernor>) -> Result<Self> {
        let filesystem = Arc::new(FilesystemEngine::new(config.filesystem.clone(), governor));
        let process = Arc::new(ProcessEngine::new(config.process.clone())?);
        let wasm = Arc::new(WasmEngine::new(config.wasm.clone(), Arc::clone(&filesystem))?);
        let backend = Arc::new(ProcessVmBackend::new(config.micro.base_env.clone()));
        let micro = Arc::new(MicroVmEngine::new(config.micro.clone(), backend)?);

        Ok(Self {
            filesystem,
            process,
            wasm,
            micro,
        })
    }

    pub fn cancellation(&self, kind: EngineKind) -> CancellationStrategy {
        match kind {
            EngineKind::Filesystem => self.filesystem.cancellation(),
            EngineKind::Process => self.process.cancellation(),
            EngineKind::Wasm => self.wasm.cancellation(),
            EngineKind::MicroVm => self.micro.cancellation(),
        }
    }

    /// Engine-specific admission checks that need engine state
    pub fn preflight(&self, op: &EngineOp) -> Result<()> {
        match op {
            EngineOp::Process(request) => self.process.preflight(request).map(|_| ()),
            EngineOp::MicroVm(op) => self.micro.preflight(op),
            EngineOp::Filesystem(_) | EngineOp::Wasm(_) => Ok(()),
        }
    }

    pub fn limits_for(
        &self,
        op: &EngineOp,
        session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits> {
        let limits = match op {
            EngineOp::Filesystem(op) => self.filesystem.limits_for(op, session, requested_timeout),
            EngineOp::Process(op) => self.process.limits_for(op, session, requested_timeout),
            EngineOp::Wasm(op) => self.wasm.limits_for(op, session, requested_timeout),
            EngineOp::MicroVm(op) => self.micro.limits_for(op, session, requested_timeout),
        }?;
        limits.validate()?;
        Ok(limits)
    }

    pub async fn invoke(&self, op: EngineOp, ctx: InvocationContext) -> Result<EngineOutput> {
        match op {
            EngineOp::Filesystem(op) => self.filesystem.invoke(op, ctx).await,
            EngineOp::Process(op) => self.process.invoke(op, ctx).await,
            EngineOp::Wasm(op) => self.wasm.invoke(op, ctx).await,
            EngineOp::MicroVm(op) => self.micro.invoke(op, ctx).await,
        }
    }
}

/// Clamp a caller timeout against an engine's default and maximum
pub(crate) fn effective_timeout(
    requested: Option<Duration>,
    default: Duration,
    max: Duration,
) -> Result<Duration> {
    let timeout = requested.unwrap_or(default);
    if timeout.is_zero() {
        return Err(EngineError::InvalidParameters(
            "timeout must be greater than zero".into(),
        ));
    }
    if timeout > max {
        return Err(EngineError::InvalidParameters(format!(
            "requested timeout {:?} exceeds maximum {:?}",
            timeout, max
        )));
    }
    Ok(timeout)
}

mod lossy_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrips_binary_as_base64() {
        let payload = Payload::from_bytes(vec![0xff, 0x00, 0x10]);
        assert!(matches!(payload, Payload::Base64(_)));
        assert_eq!(payload.to_bytes().unwrap(), vec![0xff, 0x00, 0x10]);
        assert_eq!(payload.byte_len().unwrap(), 3);

        let text = Payload::from_bytes(b"hello".to_vec());
        assert_eq!(text, Payload::text("hello"));
    }

    #[test]
    fn test_payload_wire_shape() {
        let json = serde_json::to_value(Payload::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"encoding": "utf-8", "data": "hi"}));

        let bad: Payload = serde_json::from_value(
            serde_json::json!({"encoding": "base64", "data": "!!"}),
        )
        .unwrap();
        assert!(matches!(bad.to_bytes(), Err(EngineError::InvalidParameters(_))));
    }

    #[test]
    fn test_effective_timeout_bounds() {
        let default = Duration::from_secs(30);
        let max = Duration::from_secs(60);
        assert_eq!(effective_timeout(None, default, max).unwrap(), default);
        assert!(effective_timeout(Some(Duration::ZERO), default, max).is_err());
        assert!(effective_timeout(Some(Duration::from_secs(61)), default, max).is_err());
    }

    #[test]
    fn test_engine_op_wire_shape() {
        let op: EngineOp = serde_json::from_value(serde_json::json!({
            "engine": "filesystem",
            "request": {"op": "read", "path": "src/main.rs"}
        }))
        .unwrap();
        assert_eq!(op.kind(), EngineKind::Filesystem);
        assert_eq!(op.operation_name(), "fs.read");
        assert!(op.validate().is_ok());
    }
}
