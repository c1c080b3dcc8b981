// src/runtime/resource_limiter.rs
//! Resource limits and the per-session resource governor
//!
//! Two halves:
//!
//! - [`ResourceLimits`]: an immutable snapshot of the limits a single
//!   operation runs under, captured when the task is submitted
//! - [`ResourceGovernor`]: the central authority over per-session quotas
//!   (concurrent executions, cumulative bytes written, cumulative CPU time)
//!
//! Every chargeable operation acquires quota *before* its side effect and
//! reports actual usage afterward. A failed acquisition leaves no charge.

use crate::utils::config::QuotaConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Limits for one operation, fixed at submission time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Largest single write
    pub max_write_bytes: u64,

    /// Wall-clock budget
    pub max_duration: Duration,

    /// Per-stream capture cap for process-like engines
    pub max_output_bytes: usize,

    /// Address-space ceiling (process rlimit, wasm linear memory)
    pub max_memory_bytes: Option<u64>,

    /// WebAssembly fuel budget
    pub max_fuel: Option<u64>,

    /// CPU-seconds rlimit for spawned processes
    pub max_cpu_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_write_bytes: crate::utils::config::DEFAULT_MAX_WRITE_BYTES,
            max_duration: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
            max_memory_bytes: None,
            max_fuel: None,
            max_cpu_secs: None,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for untrusted one-off runs
    pub fn strict() -> Self {
        Self {
            max_write_bytes: 64 * 1024,
            max_duration: Duration::from_secs(5),
            max_output_bytes: 64 * 1024,
            max_memory_bytes: Some(256 * 1024 * 1024),
            max_fuel: Some(1_000_000),
            max_cpu_secs: Some(5),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.max_duration = duration;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_write_bytes == 0 {
            return Err(EngineError::InvalidParameters(
                "max_write_bytes cannot be 0".into(),
            ));
        }
        if self.max_duration.is_zero() {
            return Err(EngineError::InvalidParameters("timeout cannot be 0".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(EngineError::InvalidParameters(
                "output cap cannot be 0".into(),
            ));
        }
        if self.max_fuel == Some(0) {
            return Err(EngineError::InvalidParameters("fuel cannot be 0".into()));
        }
        if let Some(memory) = self.max_memory_bytes {
            if memory < 64 * 1024 {
                return Err(EngineError::InvalidParameters(
                    "memory limit cannot be less than one wasm page (64KiB)".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Resource consumption reported by an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub bytes_written: u64,
    pub cpu_time: Duration,
    pub fuel_consumed: Option<u64>,
    pub peak_memory_bytes: Option<u64>,
}

/// Cumulative usage of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub concurrent: usize,
    pub bytes_written: u64,
    pub bytes_reserved: u64,
    pub cpu_time: Duration,
}

#[derive(Debug, Default)]
struct SessionUsage {
    concurrent: usize,
    bytes_written: u64,
    bytes_reserved: u64,
    cpu_time: Duration,
}

/// Per-session quota authority
pub struct ResourceGovernor {
    limits: QuotaConfig,
    sessions: DashMap<String, Arc<Mutex<SessionUsage>>>,
}

impl ResourceGovernor {
    pub fn new(limits: QuotaConfig) -> Self {
        Self {
            limits,
            sessions: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &QuotaConfig {
        &self.limits
    }

    fn session(&self, session: &str) -> Arc<Mutex<SessionUsage>> {
        self.sessions
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionUsage::default())))
            .clone()
    }

    /// Take one concurrent-execution slot; fails if the session is at its
    /// concurrency limit or has spent its CPU-time budget
    pub fn acquire_execution(self: &Arc<Self>, session: &str) -> Result<ExecutionPermit> {
        let usage = self.session(session);
        let mut guard = usage.lock();

        if guard.concurrent >= self.limits.max_concurrent {
            return Err(EngineError::QuotaExceeded(format!(
                "session '{}' already runs {} concurrent executions",
                session, guard.concurrent
            )));
        }
        if guard.cpu_time >= Duration::from_secs(self.limits.max_cpu_time_secs) {
            return Err(EngineError::QuotaExceeded(format!(
                "session '{}' exhausted its cpu-time budget",
                session
            )));
        }

        guard.concurrent += 1;
        debug!(session, concurrent = guard.concurrent, "execution slot acquired");
        drop(guard);

        Ok(ExecutionPermit {
            governor: Arc::clone(self),
            session: session.to_string(),
        })
    }

    /// Reserve write quota before touching the filesystem
    pub fn reserve_bytes(self: &Arc<Self>, session: &str, bytes: u64) -> Result<ByteReservation> {
        let usage = self.session(session);
        let mut guard = usage.lock();

        let projected = guard
            .bytes_written
            .saturating_add(guard.bytes_reserved)
            .saturating_add(bytes);
        if projected > self.limits.max_bytes_written {
            return Err(EngineError::QuotaExceeded(format!(
                "write of {} bytes would exceed the {} byte quota of session '{}'",
                bytes, self.limits.max_bytes_written, session
            )));
        }

        guard.bytes_reserved += bytes;
        drop(guard);

        Ok(ByteReservation {
            governor: Arc::clone(self),
            session: session.to_string(),
            reserved: bytes,
            settled: false,
        })
    }

    /// Report CPU time actually consumed
    pub fn record_cpu_time(&self, session: &str, cpu_time: Duration) {
        let usage = self.session(session);
        usage.lock().cpu_time += cpu_time;
    }

    pub fn usage(&self, session: &str) -> UsageSnapshot {
        match self.sessions.get(session) {
            Some(usage) => {
                let guard = usage.lock();
                UsageSnapshot {
                    concurrent: guard.concurrent,
                    bytes_written: guard.bytes_written,
                    bytes_reserved: guard.bytes_reserved,
                    cpu_time: guard.cpu_time,
                }
            }
            None => UsageSnapshot::default(),
        }
    }

    fn release_execution(&self, session: &str) {
        if let Some(usage) = self.sessions.get(session) {
            let mut guard = usage.lock();
            guard.concurrent = guard.concurrent.saturating_sub(1);
        }
    }

    fn settle_bytes(&self, session: &str, reserved: u64, actual: u64) {
        if let Some(usage) = self.sessions.get(session) {
            let mut guard = usage.lock();
            guard.bytes_reserved = guard.bytes_reserved.saturating_sub(reserved);
            guard.bytes_written += actual;
        }
    }
}

/// Concurrent-execution slot, released on drop
pub struct ExecutionPermit {
    governor: Arc<ResourceGovernor>,
    session: String,
}

impl ExecutionPermit {
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.governor.release_execution(&self.session);
    }
}

impl std::fmt::Debug for ExecutionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPermit").field("session", &self.session).finish()
    }
}

/// Reserved write quota; refunded on drop unless committed
pub struct ByteReservation {
    governor: Arc<ResourceGovernor>,
    session: String,
    reserved: u64,
    settled: bool,
}

impl ByteReservation {
    /// Charge the bytes actually written (at most the reserved amount)
    pub fn commit(mut self, actual: u64) {
        self.governor
            .settle_bytes(&self.session, self.reserved, actual.min(self.reserved));
        self.settled = true;
    }
}

impl Drop for ByteReservation {
    fn drop(&mut self) {
        if !self.settled {
            self.governor.settle_bytes(&self.session, self.reserved, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_concurrent: usize, max_bytes: u64) -> Arc<ResourceGovernor> {
        Arc::new(ResourceGovernor::new(QuotaConfig {
            max_concurrent,
            max_bytes_written: max_bytes,
            max_cpu_time_secs: 10,
        }))
    }

    #[test]
    fn test_default_limits_validate() {
        assert!(ResourceLimits::default().validate().is_ok());
        assert!(ResourceLimits::strict().validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let zero_timeout = ResourceLimits::default().with_duration(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let tiny_memory = ResourceLimits {
            max_memory_bytes: Some(1024),
            ..Default::default()
        };
        assert!(tiny_memory.validate().is_err());
    }

    #[test]
    fn test_concurrency_quota() {
        let gov = governor(2, 1024);
        let a = gov.acquire_execution("s1").unwrap();
        let _b = gov.acquire_execution("s1").unwrap();
        assert!(matches!(
            gov.acquire_execution("s1"),
            Err(EngineError::QuotaExceeded(_))
        ));
        // Other sessions are independent.
        assert!(gov.acquire_execution("s2").is_ok());

        drop(a);
        assert_eq!(gov.usage("s1").concurrent, 1);
        assert!(gov.acquire_execution("s1").is_ok());
    }

    #[test]
    fn test_byte_reservation_commit_and_refund() {
        let gov = governor(4, 100);
        let reservation = gov.reserve_bytes("s1", 60).unwrap();
        assert!(gov.reserve_bytes("s1", 50).is_err());
        reservation.commit(60);
        assert_eq!(gov.usage("s1").bytes_written, 60);

        // A dropped reservation leaves no charge.
        let dropped = gov.reserve_bytes("s1", 40).unwrap();
        drop(dropped);
        let usage = gov.usage("s1");
        assert_eq!(usage.bytes_written, 60);
        assert_eq!(usage.bytes_reserved, 0);
    }

    #[test]
    fn test_failed_reservation_records_nothing() {
        let gov = governor(4, 10);
        assert!(gov.reserve_bytes("s1", 11).is_err());
        assert_eq!(gov.usage("s1"), UsageSnapshot::default());
    }

    #[test]
    fn test_cpu_budget() {
        let gov = governor(4, 10);
        gov.record_cpu_time("s1", Duration::from_secs(11));
        assert!(matches!(
            gov.acquire_execution("s1"),
            Err(EngineError::QuotaExceeded(_))
        ));
    }
}
