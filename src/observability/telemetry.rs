// src/observability/telemetry.rs
//! Telemetry sink contract
//!
//! One event per terminal task: `{engine, operation, duration, outcome}`.
//! Sinks must not block the caller.

use crate::utils::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl TelemetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryOutcome::Completed => "completed",
            TelemetryOutcome::Failed => "failed",
            TelemetryOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Engine variant, or `agent`
    pub engine: String,
    pub operation: String,
    pub duration: Duration,
    pub outcome: TelemetryOutcome,
    pub error_code: Option<ErrorCode>,
    pub attempts: u32,
}

/// Fire-and-forget consumer of task telemetry
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Default sink: a structured log line plus `metrics` counters
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        metrics::counter!(
            "sandbox_tasks_total",
            "engine" => event.engine.clone(),
            "operation" => event.operation.clone(),
            "outcome" => event.outcome.as_str()
        )
        .increment(1);
        metrics::histogram!(
            "sandbox_task_duration_seconds",
            "engine" => event.engine.clone(),
            "operation" => event.operation.clone()
        )
        .record(event.duration.as_secs_f64());

        info!(
            target: "sandbox::telemetry",
            engine = %event.engine,
            operation = %event.operation,
            duration_ms = event.duration.as_millis() as u64,
            outcome = event.outcome.as_str(),
            error_code = event.error_code.map(|c| c.as_str()),
            attempts = event.attempts,
            "task finished"
        );
    }
}
