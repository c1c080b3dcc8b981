// src/runtime/micro_vm.rs
//! MicroVM engine
//!
//! Runs code inside pooled isolated instances. The engine owns the
//! [`VmPool`]; nothing else may start, stop, or mutate a pooled instance.
//!
//! Lifecycle of an instance:
//! - **Boot**: the backend prepares an instance for an image
//! - **Init**: an optional script runs once on a freshly booted instance
//! - **Execute**: code runs under the timeout / output-cap discipline of the
//!   process engine
//! - **Reset**: scratch state is restored before the instance is parked
//! - **Teardown**: unhealthy, tainted, or expired instances are destroyed
//!
//! Cancellation is forceful: the instance's process group is killed and the
//! instance is tainted so it never returns to the pool.

use crate::events::EventPublisher;
use crate::runtime::contract::{
    effective_timeout, CancellationStrategy, EngineKind, EngineOutput, ExecutionContract,
    ExecutionResult, ExecutionStatus, InvocationContext, SessionContext,
};
use crate::runtime::process_manager::{run_supervised, SpawnSpec};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::runtime::sandbox::SanitizedCommand;
use crate::runtime::vm_pool::{VmHandle, VmInfo, VmPool};
use crate::utils::config::{MicroConfig, MicroImageConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_CODE_BYTES: usize = 1024 * 1024;
const REAPER_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_MARKER: &str = ".vm";

/// One execution inside an instance
#[derive(Debug, Clone)]
pub struct VmRun {
    pub code: String,

    /// Working directory; the instance scratch dir when unset
    pub workdir: Option<PathBuf>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Isolation backend behind the pool.
///
/// Implementations own how an instance is booted and torn down; the pool
/// owns when.
#[async_trait]
pub trait VmBackend: Send + Sync {
    async fn boot(&self, vm: &VmHandle, image: &MicroImageConfig) -> Result<()>;

    async fn execute(
        &self,
        vm: &VmHandle,
        image: &MicroImageConfig,
        run: VmRun,
        events: EventPublisher,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Restore the instance to its post-boot state
    async fn reset(&self, vm: &VmHandle) -> Result<()>;

    async fn healthy(&self, vm: &VmHandle) -> bool;

    async fn destroy(&self, vm: &VmHandle) -> Result<()>;

    fn description(&self) -> String;
}

/// Backend running each instance as a private directory tree with fresh,
/// process-group-isolated interpreter processes and a cleared environment
pub struct ProcessVmBackend {
    base_env: HashMap<String, String>,
    programs: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessVmBackend {
    pub fn new(base_env: HashMap<String, String>) -> Self {
        Self {
            base_env,
            programs: Mutex::new(HashMap::new()),
        }
    }

    fn program(&self, image: &MicroImageConfig) -> Result<PathBuf> {
        if let Some(path) = self.programs.lock().get(&image.name) {
            return Ok(path.clone());
        }
        let found = match self.base_env.get("PATH") {
            Some(paths) => which::which_in(&image.command, Some(paths), "/"),
            None => which::which(&image.command),
        };
        let path = found.map_err(|e| {
            EngineError::VmBootFailed(format!(
                "image '{}' runtime '{}' not found: {}",
                image.name, image.command, e
            ))
        })?;
        self.programs.lock().insert(image.name.clone(), path.clone());
        Ok(path)
    }

    fn scratch(vm: &VmHandle) -> PathBuf {
        vm.root.join("scratch")
    }
}

#[async_trait]
impl VmBackend for ProcessVmBackend {
    async fn boot(&self, vm: &VmHandle, image: &MicroImageConfig) -> Result<()> {
        self.program(image)?;
        for dir in ["home", "tmp", "scratch"] {
            tokio::fs::create_dir_all(vm.root.join(dir))
                .await
                .map_err(|e| EngineError::VmBootFailed(format!("{}: {}", vm.id, e)))?;
        }
        tokio::fs::write(vm.root.join(HEALTH_MARKER), vm.id.as_bytes())
            .await
            .map_err(|e| EngineError::VmBootFailed(format!("{}: {}", vm.id, e)))?;
        Ok(())
    }

    async fn execute(
        &self,
        vm: &VmHandle,
        image: &MicroImageConfig,
        run: VmRun,
        events: EventPublisher,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let program = self.program(image)?;
        let script = Self::scratch(vm).join(format!("main.{}", image.script_extension()));
        tokio::fs::write(&script, run.code.as_bytes()).await?;

        let mut env: BTreeMap<String, String> = self
            .base_env
            .iter()
            .chain(image.env.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert("HOME".into(), vm.root.join("home").display().to_string());
        env.insert("TMPDIR".into(), vm.root.join("tmp").display().to_string());

        let mut args = image.args.clone();
        args.push(script.display().to_string());

        let spec = SpawnSpec {
            command: SanitizedCommand { program, args, env },
            cwd: run.workdir.unwrap_or_else(|| Self::scratch(vm)),
            timeout: run.timeout,
            max_output_bytes: run.max_output_bytes,
            truncate: true,
            max_memory_bytes: None,
            max_cpu_secs: None,
        };
        run_supervised(spec, events, cancel).await
    }

    async fn reset(&self, vm: &VmHandle) -> Result<()> {
        for dir in ["tmp", "scratch"] {
            let path = vm.root.join(dir);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::create_dir_all(&path).await?;
        }
        Ok(())
    }

    async fn healthy(&self, vm: &VmHandle) -> bool {
        tokio::fs::metadata(vm.root.join(HEALTH_MARKER)).await.is_ok()
    }

    async fn destroy(&self, vm: &VmHandle) -> Result<()> {
        match tokio::fs::remove_dir_all(&vm.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn description(&self) -> String {
        "process".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MicroOp {
    Start {
        image: String,
        #[serde(default)]
        init_script: Option<String>,
        /// Workspace subtree visible to executions
        #[serde(default)]
        mount: Option<String>,
    },
    Execute {
        vm_id: String,
        code: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Stop {
        vm_id: String,
    },
    /// Lease, execute and release in one task
    Run {
        image: String,
        code: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl MicroOp {
    pub fn name(&self) -> &'static str {
        match self {
            MicroOp::Start { .. } => "micro.start",
            MicroOp::Execute { .. } => "micro.execute",
            MicroOp::Stop { .. } => "micro.stop",
            MicroOp::Run { .. } => "micro.run",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let not_empty = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(EngineError::InvalidParameters(format!("{} must not be empty", field)))
            } else {
                Ok(())
            }
        };
        let code_size = |code: &str| {
            if code.len() > MAX_CODE_BYTES {
                Err(EngineError::SizeExceeded {
                    size: code.len() as u64,
                    limit: MAX_CODE_BYTES as u64,
                })
            } else {
                Ok(())
            }
        };
        let timeout = |timeout_ms: &Option<u64>| {
            if *timeout_ms == Some(0) {
                Err(EngineError::InvalidParameters("timeout must be greater than zero".into()))
            } else {
                Ok(())
            }
        };

        match self {
            MicroOp::Start {
                image,
                init_script,
                mount,
            } => {
                not_empty("image", image)?;
                if let Some(script) = init_script {
                    code_size(script)?;
                }
                if let Some(mount) = mount {
                    crate::runtime::workspace::Workspace::clean(mount)?;
                }
                Ok(())
            }
            MicroOp::Execute {
                vm_id,
                code,
                timeout_ms,
            } => {
                not_empty("vm_id", vm_id)?;
                code_size(code)?;
                timeout(timeout_ms)
            }
            MicroOp::Stop { vm_id } => not_empty("vm_id", vm_id),
            MicroOp::Run {
                image,
                code,
                timeout_ms,
            } => {
                not_empty("image", image)?;
                code_size(code)?;
                timeout(timeout_ms)
            }
        }
    }

    /// Operations on one instance run in submission order
    pub fn resource_keys(&self) -> Vec<String> {
        match self {
            MicroOp::Start { image, .. } => vec![format!("micro:image:{}", image)],
            MicroOp::Execute { vm_id, .. } | MicroOp::Stop { vm_id } => {
                vec![format!("micro:vm:{}", vm_id)]
            }
            MicroOp::Run { .. } => Vec::new(),
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        match self {
            MicroOp::Start {
                image,
                init_script,
                mount,
            } => json!({
                "op": self.name(),
                "image": image,
                "init_script": init_script.is_some(),
                "mount": mount,
            }),
            MicroOp::Execute { vm_id, code, .. } => json!({
                "op": self.name(),
                "vm_id": vm_id,
                "code_bytes": code.len(),
            }),
            MicroOp::Stop { vm_id } => json!({ "op": self.name(), "vm_id": vm_id }),
            MicroOp::Run { image, code, .. } => json!({
                "op": self.name(),
                "image": image,
                "code_bytes": code.len(),
            }),
        }
    }

    fn timeout_ms(&self) -> Option<u64> {
        match self {
            MicroOp::Execute { timeout_ms, .. } | MicroOp::Run { timeout_ms, .. } => *timeout_ms,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MicroOutput {
    Started(VmInfo),
    Executed(ExecutionResult),
    Stopped { vm_id: String, recycled: bool },
}

/// MicroVM engine
pub struct MicroVmEngine {
    config: MicroConfig,
    pool: Arc<VmPool>,
    backend: Arc<dyn VmBackend>,
}

impl MicroVmEngine {
    pub fn new(config: MicroConfig, backend: Arc<dyn VmBackend>) -> Result<Self> {
        for image in &config.images {
            image.validate()?;
        }
        let pool = Arc::new(VmPool::new(&config, Arc::clone(&backend))?);
        Ok(Self {
            config,
            pool,
            backend,
        })
    }

    pub fn pool(&self) -> &Arc<VmPool> {
        &self.pool
    }

    /// Reject operations on images the pool does not know
    pub fn preflight(&self, op: &MicroOp) -> Result<()> {
        match op {
            MicroOp::Start { image, .. } | MicroOp::Run { image, .. } => {
                if self.pool.image(image).is_none() {
                    return Err(EngineError::InvalidParameters(format!(
                        "unknown micro image '{}'",
                        image
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Start the idle-TTL reaper
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        self.pool
            .spawn_reaper(REAPER_INTERVAL.min(ttl.max(Duration::from_secs(1))), ttl, shutdown)
    }

    fn image(&self, name: &str) -> Result<&MicroImageConfig> {
        self.pool
            .image(name)
            .ok_or_else(|| EngineError::InvalidParameters(format!("unknown micro image '{}'", name)))
    }

    async fn start(
        &self,
        image: String,
        init_script: Option<String>,
        mount: Option<String>,
        ctx: &InvocationContext,
    ) -> Result<MicroOutput> {
        let image_config = self.image(&image)?.clone();
        let mount = match mount {
            Some(mount) => {
                let path = ctx.workspace().resolve(&mount)?;
                if !path.is_dir() {
                    return Err(EngineError::InvalidParameters(format!(
                        "mount '{}' is not a directory",
                        mount
                    )));
                }
                Some(path)
            }
            None => None,
        };

        let leased = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            leased = self.pool.lease(&image, &ctx.session.session_id, ctx.task_id, mount.clone()) => leased?,
        };
        let vm_id = leased.handle.id.clone();

        if let (true, Some(script)) = (leased.fresh, init_script) {
            let run = VmRun {
                code: script,
                workdir: mount,
                timeout: ctx.limits.max_duration,
                max_output_bytes: ctx.limits.max_output_bytes,
            };
            let result = self
                .backend
                .execute(&leased.handle, &image_config, run, ctx.events.clone(), ctx.cancel.clone())
                .await;
            let failure = match &result {
                Ok(r) if r.status == ExecutionStatus::Exited { code: 0 } => None,
                Ok(r) => Some(format!("init script ended with {:?}: {}", r.status, r.stderr_text().trim())),
                Err(err) => Some(err.to_string()),
            };
            if let Some(reason) = failure {
                self.pool.finish(&vm_id, ctx.task_id, false, true);
                let _ = self.pool.release(&vm_id, &ctx.session.session_id).await;
                if matches!(result, Err(EngineError::Cancelled))
                    || matches!(&result, Ok(r) if r.status == ExecutionStatus::Cancelled)
                {
                    return Err(EngineError::Cancelled);
                }
                return Err(EngineError::VmBootFailed(reason));
            }
        }

        self.pool.finish(&vm_id, ctx.task_id, false, false);
        info!(vm_id = %vm_id, image = %image, session = %ctx.session.session_id, "vm leased");
        self.pool
            .info(&vm_id)
            .map(MicroOutput::Started)
            .ok_or_else(|| EngineError::Internal(format!("lease for '{}' vanished", vm_id)))
    }

    async fn execute(&self, vm_id: &str, code: String, ctx: &InvocationContext) -> Result<ExecutionResult> {
        let active = self.pool.checkout(vm_id, &ctx.session.session_id, ctx.task_id)?;
        let image = self.image(&active.handle.image)?.clone();
        let _exclusive = active.exec_lock.lock().await;

        let run = VmRun {
            code,
            workdir: active.mount.clone(),
            timeout: ctx.limits.max_duration,
            max_output_bytes: ctx.limits.max_output_bytes,
        };
        let result = self
            .backend
            .execute(&active.handle, &image, run, ctx.events.clone(), ctx.cancel.clone())
            .await;

        let tainted = match &result {
            Ok(r) => matches!(r.status, ExecutionStatus::TimedOut | ExecutionStatus::Cancelled),
            Err(_) => true,
        };
        if tainted {
            warn!(vm_id, "execution aborted, instance tainted");
        }
        self.pool.finish(vm_id, ctx.task_id, true, tainted);
        debug!(vm_id, "vm execution finished");
        result
    }

    async fn run(&self, image: String, code: String, ctx: &InvocationContext) -> Result<ExecutionResult> {
        self.image(&image)?;
        let leased = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            leased = self.pool.lease(&image, &ctx.session.session_id, ctx.task_id, None) => leased?,
        };
        let vm_id = leased.handle.id;
        let result = self.execute(&vm_id, code, ctx).await;
        if let Err(err) = self.pool.release(&vm_id, &ctx.session.session_id).await {
            warn!(vm_id = %vm_id, error = %err, "release after run failed");
        }
        result
    }
}

#[async_trait]
impl ExecutionContract for MicroVmEngine {
    type Op = MicroOp;

    fn kind(&self) -> EngineKind {
        EngineKind::MicroVm
    }

    fn cancellation(&self) -> CancellationStrategy {
        CancellationStrategy::Forceful
    }

    fn limits_for(
        &self,
        op: &MicroOp,
        _session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits> {
        let requested = requested_timeout.or(op.timeout_ms().map(Duration::from_millis));
        Ok(ResourceLimits {
            max_duration: effective_timeout(
                requested,
                Duration::from_secs(self.config.default_timeout_secs),
                Duration::from_secs(self.config.max_timeout_secs),
            )?,
            max_output_bytes: self.config.max_output_bytes,
            ..ResourceLimits::default()
        })
    }

    async fn invoke(&self, op: MicroOp, ctx: InvocationContext) -> Result<EngineOutput> {
        self.preflight(&op)?;
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let output = match op {
            MicroOp::Start {
                image,
                init_script,
                mount,
            } => self.start(image, init_script, mount, &ctx).await?,
            MicroOp::Execute { vm_id, code, .. } => {
                MicroOutput::Executed(self.execute(&vm_id, code, &ctx).await?)
            }
            MicroOp::Stop { vm_id } => {
                let recycled = self.pool.release(&vm_id, &ctx.session.session_id).await?;
                info!(vm_id = %vm_id, recycled, "vm released");
                MicroOutput::Stopped { vm_id, recycled }
            }
            MicroOp::Run { image, code, .. } => MicroOutput::Executed(self.run(image, code, &ctx).await?),
        };
        Ok(EngineOutput::MicroVm(output))
    }
}
