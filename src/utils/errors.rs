// src/utils/errors.rs
//! Error taxonomy for the execution layer
//!
//! Every failure surfaced by an engine, the governor, or the dispatcher is an
//! [`EngineError`]. Each variant maps to:
//!
//! - a stable, namespaced [`ErrorCode`] used on the wire
//! - an [`ErrorClass`] deciding retry behaviour in the dispatcher

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("command '{0}' is not allowed")]
    CommandNotAllowed(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("{stream} output exceeded limit of {limit} bytes")]
    OutputCapExceeded { stream: &'static str, limit: usize },

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("vm pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("vm boot failed: {0}")]
    VmBootFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("workspace corrupted: {0}")]
    WorkspaceCorrupted(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable wire-level error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "sandbox.invalid_params")]
    InvalidParams,
    #[serde(rename = "sandbox.command_not_allowed")]
    CommandNotAllowed,
    #[serde(rename = "sandbox.timeout")]
    Timeout,
    #[serde(rename = "sandbox.output_cap_exceeded")]
    OutputCapExceeded,
    #[serde(rename = "sandbox.path_escape")]
    PathEscape,
    #[serde(rename = "sandbox.size_exceeded")]
    SizeExceeded,
    #[serde(rename = "sandbox.quota_exceeded")]
    QuotaExceeded,
    #[serde(rename = "sandbox.pool_exhausted")]
    PoolExhausted,
    #[serde(rename = "sandbox.resource_exceeded")]
    ResourceExceeded,
    #[serde(rename = "sandbox.io_error")]
    IoError,
    #[serde(rename = "sandbox.not_found")]
    NotFound,
    #[serde(rename = "sandbox.unauthorized")]
    Unauthorized,
    #[serde(rename = "sandbox.cancelled")]
    Cancelled,
    #[serde(rename = "sandbox.execution_failed")]
    ExecutionFailed,
    #[serde(rename = "sandbox.internal_error")]
    InternalError,
}

impl ErrorCode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParams => "sandbox.invalid_params",
            ErrorCode::CommandNotAllowed => "sandbox.command_not_allowed",
            ErrorCode::Timeout => "sandbox.timeout",
            ErrorCode::OutputCapExceeded => "sandbox.output_cap_exceeded",
            ErrorCode::PathEscape => "sandbox.path_escape",
            ErrorCode::SizeExceeded => "sandbox.size_exceeded",
            ErrorCode::QuotaExceeded => "sandbox.quota_exceeded",
            ErrorCode::PoolExhausted => "sandbox.pool_exhausted",
            ErrorCode::ResourceExceeded => "sandbox.resource_exceeded",
            ErrorCode::IoError => "sandbox.io_error",
            ErrorCode::NotFound => "sandbox.not_found",
            ErrorCode::Unauthorized => "sandbox.unauthorized",
            ErrorCode::Cancelled => "sandbox.cancelled",
            ErrorCode::ExecutionFailed => "sandbox.execution_failed",
            ErrorCode::InternalError => "sandbox.internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure class, deciding how the dispatcher reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any side effect, never retried
    Validation,
    /// Quota, timeout, fuel or memory limits; not retried
    ResourceLimit,
    /// Spawn or boot failures; retried once with backoff
    Transient,
    /// Surfaced immediately
    Fatal,
}

impl EngineError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidParameters(_) | EngineError::ConfigError(_) => {
                ErrorCode::InvalidParams
            }
            EngineError::CommandNotAllowed(_) => ErrorCode::CommandNotAllowed,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::OutputCapExceeded { .. } => ErrorCode::OutputCapExceeded,
            EngineError::PathEscape(_) => ErrorCode::PathEscape,
            EngineError::SizeExceeded { .. } => ErrorCode::SizeExceeded,
            EngineError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            EngineError::PoolExhausted(_) => ErrorCode::PoolExhausted,
            EngineError::ResourceExceeded(_) => ErrorCode::ResourceExceeded,
            EngineError::Io(_) => ErrorCode::IoError,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Unauthorized(_) => ErrorCode::Unauthorized,
            EngineError::Cancelled => ErrorCode::Cancelled,
            EngineError::SpawnFailed(_)
            | EngineError::VmBootFailed(_)
            | EngineError::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            EngineError::WorkspaceCorrupted(_) | EngineError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidParameters(_)
            | EngineError::CommandNotAllowed(_)
            | EngineError::PathEscape(_)
            | EngineError::SizeExceeded { .. }
            | EngineError::NotFound(_)
            | EngineError::Unauthorized(_)
            | EngineError::ConfigError(_) => ErrorClass::Validation,
            EngineError::Timeout(_)
            | EngineError::OutputCapExceeded { .. }
            | EngineError::QuotaExceeded(_)
            | EngineError::ResourceExceeded(_)
            | EngineError::Cancelled => ErrorClass::ResourceLimit,
            EngineError::SpawnFailed(_) | EngineError::VmBootFailed(_) => ErrorClass::Transient,
            EngineError::PoolExhausted(_)
            | EngineError::WorkspaceCorrupted(_)
            | EngineError::Io(_)
            | EngineError::ExecutionFailed(_)
            | EngineError::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the dispatcher may retry this error
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidParameters(err.to_string())
    }
}
