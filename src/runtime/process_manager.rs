// src/runtime/process_manager.rs
//! Process runtime engine
//!
//! Runs allow-listed commands with a cleared environment, cwd pinned to the
//! workspace root, and each child in its own process group:
//!
//! ```text
//! sanitize ──→ spawn (pgid = pid) ──┬──→ stdout reader ──→ event bus + bounded buffer
//!                                   ├──→ stderr reader ──→ event bus + bounded buffer
//!                                   └──→ select { exit | timeout | cancel | overflow }
//!                                              │
//!                  killpg(SIGKILL) ──→ read CPU time ──→ reap ──→ join readers
//! ```
//!
//! A non-zero exit is a normal result. A timeout is reported as
//! [`ExecutionStatus::TimedOut`] with the partial output. Exit is observed
//! with `waitid(WNOWAIT)` so the child's CPU time can be read from `/proc`
//! before it is reaped. If supervision is dropped midway, the whole group is
//! killed.

use crate::events::{EventPublisher, StreamKind};
use crate::runtime::contract::{
    effective_timeout, CancellationStrategy, EngineKind, EngineOutput, ExecutionContract,
    ExecutionResult, ExecutionStatus, InvocationContext, SessionContext,
};
use crate::runtime::output::capture_stream;
use crate::runtime::resource_limiter::{ResourceLimits, ResourceUsage};
use crate::runtime::sandbox::{apply_rlimits, SandboxPolicy, SanitizedCommand};
use crate::utils::config::ProcessConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::{sysconf, Pid, SysconfVar};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long readers may keep draining after the group is killed
const READER_GRACE: Duration = Duration::from_millis(250);

fn default_true() -> bool {
    true
}

/// A `run.exec` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Discard output past the cap instead of failing
    #[serde(default = "default_true")]
    pub truncate: bool,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            timeout_ms: None,
            truncate: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(EngineError::InvalidParameters("command must not be empty".into()));
        }
        if self.timeout_ms == Some(0) {
            return Err(EngineError::InvalidParameters("timeout must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn summary(&self) -> serde_json::Value {
        let mut env_keys: Vec<&String> = self.env.keys().collect();
        env_keys.sort();
        json!({
            "op": "run.exec",
            "command": self.command,
            "args": self.args,
            "env_keys": env_keys,
        })
    }
}

/// Everything needed to run one supervised child
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: SanitizedCommand,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub truncate: bool,
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_secs: Option<u64>,
}

enum Stop {
    Exited(Option<Duration>),
    TimedOut,
    Cancelled,
    Overflow,
}

/// Spawn a child in its own process group and supervise it to completion
pub async fn run_supervised(
    spec: SpawnSpec,
    events: EventPublisher,
    cancel: CancellationToken,
) -> Result<ExecutionResult> {
    let mut command = Command::new(&spec.command.program);
    command
        .args(&spec.command.args)
        .env_clear()
        .envs(&spec.command.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    if spec.max_memory_bytes.is_some() || spec.max_cpu_secs.is_some() {
        let (memory, cpu) = (spec.max_memory_bytes, spec.max_cpu_secs);
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || apply_rlimits(memory, cpu));
        }
    }

    let started = Instant::now();
    let mut child = command.spawn().map_err(|e| {
        EngineError::SpawnFailed(format!("{}: {}", spec.command.program.display(), e))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| EngineError::SpawnFailed("child exited before supervision".into()))?;
    let mut group = GroupGuard { pid, armed: true };
    debug!(pid, program = %spec.command.program.display(), "process spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Internal("stdout pipe missing".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Internal("stderr pipe missing".into()))?;

    let overflow = CancellationToken::new();
    let stop_readers = CancellationToken::new();
    let stdout_task = tokio::spawn(capture_stream(
        stdout,
        StreamKind::Stdout,
        spec.max_output_bytes,
        events.clone(),
        overflow.clone(),
        stop_readers.clone(),
    ));
    let stderr_task = tokio::spawn(capture_stream(
        stderr,
        StreamKind::Stderr,
        spec.max_output_bytes,
        events.clone(),
        overflow.clone(),
        stop_readers.clone(),
    ));

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);
    let mut exited = tokio::task::spawn_blocking(move || await_exit(pid));

    let stop = tokio::select! {
        biased;
        waited = &mut exited => {
            let cpu_time = waited
                .map_err(|e| EngineError::Internal(format!("exit watcher: {}", e)))?
                .map_err(|e| EngineError::Internal(format!("waitid({}): {}", pid, e)))?;
            Stop::Exited(cpu_time)
        }
        _ = cancel.cancelled() => Stop::Cancelled,
        _ = &mut deadline => Stop::TimedOut,
        _ = overflow.cancelled(), if !spec.truncate => Stop::Overflow,
    };

    // Stragglers left in the group go down with the leader.
    kill_group(pid);
    let cpu_time = match stop {
        Stop::Exited(cpu_time) => cpu_time,
        _ => exited.await.ok().and_then(|waited| waited.ok()).flatten(),
    };
    let exit = child.wait().await?;
    group.armed = false;
    if cpu_time.is_none() {
        debug!(pid, "cpu time unavailable");
    }

    let reader_deadline = tokio::time::sleep(READER_GRACE);
    tokio::pin!(reader_deadline);
    let readers = async {
        let out = stdout_task.await;
        let err = stderr_task.await;
        (out, err)
    };
    tokio::pin!(readers);
    let (stdout, stderr) = tokio::select! {
        joined = &mut readers => joined,
        _ = &mut reader_deadline => {
            stop_readers.cancel();
            readers.await
        }
    };
    let stdout = stdout.map_err(|e| EngineError::Internal(format!("stdout reader: {}", e)))?;
    let stderr = stderr.map_err(|e| EngineError::Internal(format!("stderr reader: {}", e)))?;
    let duration = started.elapsed();

    let status = match stop {
        Stop::TimedOut => ExecutionStatus::TimedOut,
        Stop::Cancelled => ExecutionStatus::Cancelled,
        Stop::Overflow => {
            let stream = if stdout.truncated { "stdout" } else { "stderr" };
            warn!(pid, stream, "output cap exceeded, process stopped");
            return Err(EngineError::OutputCapExceeded {
                stream,
                limit: spec.max_output_bytes,
            });
        }
        Stop::Exited(_) => exit_status(exit),
    };

    debug!(pid, ?status, ?duration, "process finished");

    Ok(ExecutionResult {
        status,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        duration,
        usage: ResourceUsage {
            cpu_time: cpu_time.unwrap_or_default(),
            ..ResourceUsage::default()
        },
    })
}

/// Kills the child's group unless supervision got as far as reaping it
struct GroupGuard {
    pid: u32,
    armed: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_group(self.pid);
        }
    }
}

/// Block until `pid` exits without reaping it, then read its CPU time
fn await_exit(pid: u32) -> nix::Result<Option<Duration>> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
            Ok(_) => return Ok(cpu_time(pid)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// User plus system time of a process and the children it reaped
fn cpu_time(pid: u32) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces; utime, stime, cutime, cstime follow it at 14..=17.
    let fields: Vec<&str> = stat.rsplit_once(')')?.1.split_whitespace().collect();
    let ticks = fields
        .get(11..15)?
        .iter()
        .map(|field| field.parse::<u64>().ok())
        .sum::<Option<u64>>()?;
    let hz = sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .filter(|hz| *hz > 0)
        .unwrap_or(100) as u64;
    Some(Duration::from_millis(ticks.saturating_mul(1000) / hz))
}

fn exit_status(status: std::process::ExitStatus) -> ExecutionStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExecutionStatus::Exited { code },
        (None, Some(signal)) => ExecutionStatus::Signaled { signal },
        (None, None) => ExecutionStatus::Exited { code: -1 },
    }
}

/// SIGKILL the whole process group; a group that is already gone is fine
pub fn kill_group(pid: u32) {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to kill process group"),
    }
}

/// Process runtime engine
pub struct ProcessEngine {
    config: ProcessConfig,
    policy: SandboxPolicy,
}

impl ProcessEngine {
    pub fn new(config: ProcessConfig) -> Result<Self> {
        if config.allowed_commands.is_empty() {
            warn!("process engine started with an empty command allow-list");
        }
        let policy = SandboxPolicy::new(&config);
        Ok(Self { config, policy })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Policy checks done at dispatch time, before any side effect
    pub fn preflight(&self, request: &ProcessRequest) -> Result<SanitizedCommand> {
        self.policy
            .sanitize(&request.command, &request.args, &request.env)
    }
}

#[async_trait]
impl ExecutionContract for ProcessEngine {
    type Op = ProcessRequest;

    fn kind(&self) -> EngineKind {
        EngineKind::Process
    }

    fn cancellation(&self) -> CancellationStrategy {
        CancellationStrategy::Forceful
    }

    fn limits_for(
        &self,
        op: &ProcessRequest,
        _session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits> {
        let requested = requested_timeout.or(op.timeout_ms.map(Duration::from_millis));
        let timeout = effective_timeout(
            requested,
            Duration::from_secs(self.config.default_timeout_secs),
            Duration::from_secs(self.config.max_timeout_secs),
        )?;
        Ok(ResourceLimits {
            max_duration: timeout,
            max_output_bytes: self.config.max_output_bytes,
            ..ResourceLimits::default()
        })
    }

    async fn invoke(&self, op: ProcessRequest, ctx: InvocationContext) -> Result<EngineOutput> {
        let command = self.preflight(&op)?;
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        info!(
            task_id = %ctx.task_id,
            command = %op.command,
            args = op.args.len(),
            timeout = ?ctx.limits.max_duration,
            "running process"
        );

        let spec = SpawnSpec {
            command,
            cwd: ctx.workspace().root().to_path_buf(),
            timeout: ctx.limits.max_duration,
            max_output_bytes: ctx.limits.max_output_bytes,
            truncate: op.truncate,
            max_memory_bytes: ctx.limits.max_memory_bytes,
            max_cpu_secs: ctx.limits.max_cpu_secs,
        };
        let result = run_supervised(spec, ctx.events.clone(), ctx.cancel.clone()).await?;
        Ok(EngineOutput::Process(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::workspace::Workspace;

    fn setup() -> (tempfile::TempDir, ProcessEngine, SessionContext) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path().join("ws")).unwrap();
        let engine = ProcessEngine::new(ProcessConfig::default()).unwrap();
        (dir, engine, SessionContext::new("user", "session", workspace))
    }

    async fn run(
        engine: &ProcessEngine,
        session: &SessionContext,
        request: ProcessRequest,
    ) -> Result<ExecutionResult> {
        let limits = engine.limits_for(&request, session, None)?;
        let ctx = InvocationContext::detached(session.clone(), limits);
        match engine.invoke(request, ctx).await? {
            EngineOutput::Process(result) => Ok(result),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_captures_stdout() {
        let (_dir, engine, session) = setup();
        let result = run(&engine, &session, ProcessRequest::new("echo", &["hello"]))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Exited { code: 0 });
        assert_eq!(result.stdout_text(), "hello\n");
        assert!(!result.truncated());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "echo oops >&2; exit 3"]);
        let result = run(&engine, &session, request).await.unwrap();
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stderr_text(), "oops\n");
    }

    #[tokio::test]
    async fn test_cwd_is_workspace_root_and_env_is_cleared() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "pwd; echo \"home=$HOME\""]);
        let result = run(&engine, &session, request).await.unwrap();
        let expected = format!("{}\nhome=\n", session.workspace.root().display());
        assert_eq!(result.stdout_text(), expected);
    }

    #[tokio::test]
    async fn test_timeout_kills_within_margin() {
        let (_dir, engine, session) = setup();
        let request =
            ProcessRequest::new("sh", &["-c", "sleep 60"]).with_timeout(Duration::from_secs(1));
        let started = Instant::now();
        let result = run(&engine, &session, request).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_output_truncated_at_cap() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "head -c 3000000 /dev/zero"]);
        let result = run(&engine, &session, request).await.unwrap();
        assert!(result.stdout_truncated);
        assert_eq!(result.stdout.len(), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_overflow_fails_when_truncation_disabled() {
        let (_dir, engine, session) = setup();
        let mut request = ProcessRequest::new("sh", &["-c", "head -c 3000000 /dev/zero; sleep 30"]);
        request.truncate = false;
        let result = run(&engine, &session, request).await;
        assert!(matches!(result, Err(EngineError::OutputCapExceeded { stream: "stdout", .. })));
    }

    #[tokio::test]
    async fn test_cancel_is_forceful() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "sleep 60"]);
        let limits = engine.limits_for(&request, &session, None).unwrap();
        let ctx = InvocationContext::detached(session.clone(), limits);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let output = engine.invoke(request, ctx).await.unwrap();
        assert_eq!(output.execution().unwrap().status, ExecutionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sleep_charges_little_cpu() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "sleep 1"]);
        let result = run(&engine, &session, request).await.unwrap();
        assert_eq!(result.exit_code(), Some(0));
        assert!(result.duration >= Duration::from_millis(900));
        assert!(result.usage.cpu_time < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_busy_loop_charges_cpu() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "i=0; while [ $i -lt 300000 ]; do i=$((i+1)); done"]);
        let result = run(&engine, &session, request).await.unwrap();
        assert_eq!(result.exit_code(), Some(0));
        assert!(result.usage.cpu_time > Duration::ZERO);
        assert!(result.usage.cpu_time <= result.duration + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dropped_supervision_kills_background_children() {
        let (_dir, engine, session) = setup();
        let request = ProcessRequest::new("sh", &["-c", "sleep 30 & echo $! > bg.pid; wait"]);
        let limits = engine.limits_for(&request, &session, None).unwrap();
        let ctx = InvocationContext::detached(session.clone(), limits);
        let spec = SpawnSpec {
            command: engine.preflight(&request).unwrap(),
            cwd: session.workspace.root().to_path_buf(),
            timeout: Duration::from_secs(60),
            max_output_bytes: 1024,
            truncate: true,
            max_memory_bytes: None,
            max_cpu_secs: None,
        };
        let supervised = tokio::spawn(run_supervised(spec, ctx.events.clone(), ctx.cancel.clone()));

        let pid_file = session.workspace.root().join("bg.pid");
        let mut background = None;
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok())
            {
                background = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let background = background.expect("background pid written");

        supervised.abort();
        let _ = supervised.await;

        let mut gone = false;
        for _ in 0..100 {
            match std::fs::read_to_string(format!("/proc/{}/stat", background)) {
                Err(_) => gone = true,
                Ok(stat) => {
                    gone = stat
                        .rsplit_once(')')
                        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                        .unwrap_or(false)
                }
            }
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "background child {} survived", background);
    }

    #[tokio::test]
    async fn test_policy_rejections() {
        let (_dir, engine, session) = setup();
        let result = run(&engine, &session, ProcessRequest::new("rm", &["-rf", "."])).await;
        assert!(matches!(result, Err(EngineError::CommandNotAllowed(_))));

        let mut request = ProcessRequest::new("echo", &["x"]);
        request.env.insert("LD_PRELOAD".into(), "/tmp/evil.so".into());
        assert!(matches!(
            run(&engine, &session, request).await,
            Err(EngineError::InvalidParameters(_))
        ));

        let too_long = ProcessRequest::new("echo", &[]).with_timeout(Duration::from_secs(3600));
        assert!(engine.limits_for(&too_long, &session, None).is_err());
    }
}
