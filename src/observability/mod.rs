// src/observability/mod.rs
//! Logging, metrics, and the telemetry sink
//!
//! - **Tracing**: `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`,
//!   default `info`), pretty or JSON output
//! - **Metrics**: recorded through the `metrics` facade; installing an
//!   exporter is left to the embedding process
//! - **Telemetry**: fire-and-forget per-task events, see [`telemetry`]

pub mod telemetry;

pub use telemetry::{TelemetryEvent, TelemetryOutcome, TelemetrySink, TracingTelemetry};

use crate::utils::config::LogFormat;
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| EngineError::ConfigError(format!("tracing init failed: {}", e)))
}

/// Register descriptions for every metric the engine records
pub fn describe_metrics() {
    describe_counter!("sandbox_tasks_total", "Tasks reaching a terminal state, by operation and outcome");
    describe_histogram!(
        "sandbox_task_duration_seconds",
        Unit::Seconds,
        "Wall-clock time from start to terminal state"
    );
    describe_counter!("sandbox_task_retries_total", "Transient failures retried by the dispatcher");
    describe_counter!("sandbox_watchdog_fired_total", "Tasks stopped by the dispatcher watchdog");
    describe_gauge!("sandbox_tasks_active", "Tasks pending or running");
    describe_counter!("sandbox_vm_pool_boots_total", "Micro-VM instances booted, by image");
    describe_counter!("sandbox_vm_pool_evictions_total", "Micro-VM instances torn down, by image");
    describe_counter!("sandbox_bytes_written_total", Unit::Bytes, "Bytes committed to workspaces");
}
