// src/gateway/rpc.rs
//! Wire records of the RPC surface
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! → {"id": 1, "token": "…", "method": "fs.write", "params": {"path": "a.txt", "content": {...}}}
//! ← {"id": 1, "ok": true, "result": {...}}
//! ← {"id": 1, "ok": false, "error": {"code": "sandbox.path_escape", "message": "..."}}
//! ← {"id": 7, "task_id": "…", "seq": 2, "type": "output", ...}   (run.stream, before the response)
//! ```

use crate::agent::AgentRequest;
use crate::dispatcher::{TaskId, TaskState};
use crate::events::{EventKind, StreamKind, TaskEvent};
use crate::runtime::contract::{EngineOp, Payload};
use crate::utils::errors::{EngineError, ErrorCode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub token: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,

    /// Partial output or task details, when there are any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&EngineError> for RpcError {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Streamed event frame; output bytes travel as a [`Payload`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcEvent {
    pub id: Value,
    pub task_id: TaskId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: WireEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    StateChanged { from: Option<TaskState>, to: TaskState },
    Output { stream: StreamKind, data: Payload },
    Message { text: String },
}

impl RpcEvent {
    pub fn new(id: &Value, event: &TaskEvent) -> Self {
        let wire = match &event.kind {
            EventKind::StateChanged { from, to } => WireEvent::StateChanged { from: *from, to: *to },
            EventKind::Output { stream, data } => WireEvent::Output {
                stream: *stream,
                data: Payload::from_bytes(data.to_vec()),
            },
            EventKind::Message { text } => WireEvent::Message { text: text.clone() },
        };
        Self {
            id: id.clone(),
            task_id: event.task_id,
            seq: event.seq,
            timestamp: event.timestamp,
            event: wire,
        }
    }
}

/// Parameters shared by every task-creating method
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonParams {
    /// Session within the caller's project
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_session() -> String {
    "default".to_string()
}

impl CommonParams {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A parsed method call
#[derive(Debug, Clone)]
pub enum Method {
    /// Runs synchronously; the response carries the output
    Engine(EngineOp),
    /// `run.stream`: like `run.exec`, but events are forwarded first
    Stream(EngineOp),
    Kill(TaskRef),
    AgentDispatch(AgentRequest),
    AgentStatus(TaskRef),
    AgentCancel(TaskRef),
    AgentList(ListParams),
    AgentHistory(ListParams),
    AgentProfiles,
}

impl Method {
    /// Decode `method` and its params
    pub fn parse(method: &str, params: &Value) -> Result<Self> {
        let params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };

        let parsed = match method.split_once('.') {
            Some(("fs", op)) => Method::Engine(EngineOp::Filesystem(tagged(op, params)?)),
            Some(("wasm", op)) => Method::Engine(EngineOp::Wasm(tagged(op, params)?)),
            Some(("micro", op)) => Method::Engine(EngineOp::MicroVm(tagged(op, params)?)),
            Some(("run", "exec")) => Method::Engine(EngineOp::Process(serde_json::from_value(params)?)),
            Some(("run", "stream")) => Method::Stream(EngineOp::Process(serde_json::from_value(params)?)),
            Some(("run", "kill")) => Method::Kill(serde_json::from_value(params)?),
            Some(("agent", "dispatch")) => Method::AgentDispatch(serde_json::from_value(params)?),
            Some(("agent", "status")) => Method::AgentStatus(serde_json::from_value(params)?),
            Some(("agent", "cancel")) => Method::AgentCancel(serde_json::from_value(params)?),
            Some(("agent", "list")) => Method::AgentList(serde_json::from_value(params)?),
            Some(("agent", "history")) => Method::AgentHistory(serde_json::from_value(params)?),
            Some(("agent", "profiles")) => Method::AgentProfiles,
            _ => {
                return Err(EngineError::InvalidParameters(format!(
                    "unknown method '{}'",
                    method
                )))
            }
        };

        // Engine ops must agree with the method name they were reached through.
        if let Method::Engine(op) = &parsed {
            if op.operation_name() != method && !matches!(op, EngineOp::Process(_)) {
                return Err(EngineError::InvalidParameters(format!(
                    "unknown method '{}'",
                    method
                )));
            }
        }
        Ok(parsed)
    }
}

/// Inject the operation tag taken from the method name
fn tagged<T: serde::de::DeserializeOwned>(op: &str, params: Value) -> Result<T> {
    let Value::Object(mut fields) = params else {
        return Err(EngineError::InvalidParameters("params must be an object".into()));
    };
    fields.insert("op".to_string(), Value::String(op.to_string()));
    Ok(serde_json::from_value(Value::Object(fields))?)
}
