// src/dispatcher/task.rs
//! Task model
//!
//! A task moves through a forward-only state machine:
//!
//! ```text
//! pending ──→ running ──→ completed
//!    │           ├──────→ failed
//!    │           └──────→ cancelled
//!    └──────────────────→ cancelled
//! ```
//!
//! Terminal states never transition again.

use crate::agent::{AgentOutcome, AgentRequest};
use crate::runtime::contract::{EngineKind, EngineOp, EngineOutput, SessionContext};
use crate::utils::errors::{EngineError, ErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

/// Task identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(TaskId)
            .map_err(|e| EngineError::InvalidParameters(format!("invalid task id '{}': {}", s, e)))
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Running) => true,
            (TaskState::Pending, TaskState::Cancelled) => true,
            (TaskState::Running, TaskState::Completed)
            | (TaskState::Running, TaskState::Failed)
            | (TaskState::Running, TaskState::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum TaskKind {
    Engine(EngineOp),
    Agent(AgentRequest),
}

impl TaskKind {
    /// Operation label, e.g. `fs.write` or `agent.code`
    pub fn label(&self) -> String {
        match self {
            TaskKind::Engine(op) => op.operation_name().to_string(),
            TaskKind::Agent(request) => format!("agent.{}", request.agent),
        }
    }

    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            TaskKind::Engine(op) => Some(op.kind()),
            TaskKind::Agent(_) => None,
        }
    }
}

/// A unit of work submitted to the dispatcher
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub session: SessionContext,
    pub kind: TaskKind,

    /// Caller-requested wall-clock budget; engine default when unset
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn engine(session: SessionContext, op: EngineOp) -> Self {
        Self {
            session,
            kind: TaskKind::Engine(op),
            timeout: None,
        }
    }

    pub fn agent(session: SessionContext, request: AgentRequest) -> Self {
        Self {
            session,
            kind: TaskKind::Agent(request),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Error recorded on a failed or cancelled task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }
}

impl From<&EngineError> for TaskError {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Result recorded on a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Engine(EngineOutput),
    Agent(AgentOutcome),
}

/// Read-only view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    pub state: TaskState,
    pub user_id: String,
    pub session_id: String,

    /// Compact description of the input
    pub input: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub attempts: u32,
    pub resource_keys: Vec<String>,
}

impl TaskSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Mutable task record owned by the dispatcher
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub snapshot: TaskSnapshot,
}

impl TaskRecord {
    pub fn new(id: TaskId, spec: &TaskSpec, input: serde_json::Value, resource_keys: Vec<String>) -> Self {
        Self {
            snapshot: TaskSnapshot {
                id,
                operation: spec.kind.label(),
                engine: spec.kind.engine(),
                state: TaskState::Pending,
                user_id: spec.session.user_id.clone(),
                session_id: spec.session.session_id.clone(),
                input,
                output: None,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                attempts: 0,
                resource_keys,
            },
        }
    }

    pub fn state(&self) -> TaskState {
        self.snapshot.state
    }

    /// Apply a transition; returns the previous state if it was legal
    pub fn transition(&mut self, next: TaskState) -> Option<TaskState> {
        let current = self.snapshot.state;
        if !current.can_transition_to(next) {
            return None;
        }
        self.snapshot.state = next;
        let now = Utc::now();
        if next == TaskState::Running {
            self.snapshot.started_at = Some(now);
        }
        if next.is_terminal() {
            self.snapshot.completed_at = Some(now);
        }
        Some(current)
    }
}
