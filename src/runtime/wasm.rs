// src/runtime/wasm.rs
//! WebAssembly engine
//!
//! Modules run on wasmtime with:
//! - **Fuel**: a deterministic step budget; exhaustion traps with
//!   `resource-exceeded` after consuming exactly the budget
//! - **Memory ceiling**: `StoreLimits` with grow failures turned into traps
//! - **Cooperative cancellation**: the store yields every `yield_interval`
//!   fuel units, where the cancellation token is observed
//!
//! Host capabilities are explicit. A module may only import what the call
//! grants:
//!
//! | import                   | granted by                      |
//! |--------------------------|---------------------------------|
//! | `sandbox.input_len`      | `capabilities.input_path`       |
//! | `sandbox.read_input`     | `capabilities.input_path`       |
//! | `workspace.read`         | `capabilities.workspace_io`     |
//! | `workspace.write`        | `capabilities.workspace_io`     |
//!
//! Workspace access goes through the filesystem engine, so every path is
//! re-validated. Writes are limited to the declared `write_paths`, which
//! also become the call's resource keys. They are buffered and committed
//! as one batch when the call returns successfully.

use crate::runtime::contract::{
    effective_timeout, CancellationStrategy, EngineKind, EngineOutput, ExecutionContract,
    InvocationContext, Payload, SessionContext,
};
use crate::runtime::filesystem::FilesystemEngine;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::runtime::workspace::Workspace;
use crate::utils::config::WasmConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, ExternType, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
    Trap, Val, ValType,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_MODULE_BYTES: usize = 16 * 1024 * 1024;
const MAX_INPUT_BYTES: u64 = 4 * 1024 * 1024;
const MAX_GUEST_PATH: i32 = 4096;
const WASM_PAGE: u64 = 64 * 1024;

/// Host-call error codes returned to the guest
const ERR_DENIED: i32 = -1;
const ERR_NOT_FOUND: i32 = -2;
const ERR_TOO_LARGE: i32 = -3;
const ERR_IO: i32 = -4;

/// A typed wasm value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

/// Where the module for a call comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleSource {
    Cached { module_id: String },
    Inline { wasm: Payload },
}

/// Host capabilities granted to one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmCapabilities {
    /// Workspace file exposed read-only through `sandbox.read_input`
    #[serde(default)]
    pub input_path: Option<String>,

    /// Allow `workspace.read` / `workspace.write`
    #[serde(default)]
    pub workspace_io: bool,

    /// Files `workspace.write` may replace; writes elsewhere are denied
    #[serde(default)]
    pub write_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WasmOp {
    Load {
        module: Payload,
    },
    Call {
        module: ModuleSource,
        function: String,
        #[serde(default)]
        args: Vec<WasmValue>,
        #[serde(default)]
        fuel: Option<u64>,
        #[serde(default)]
        capabilities: WasmCapabilities,
    },
    MemoryLimit {
        bytes: u64,
    },
}

impl WasmOp {
    pub fn name(&self) -> &'static str {
        match self {
            WasmOp::Load { .. } => "wasm.load",
            WasmOp::Call { .. } => "wasm.call",
            WasmOp::MemoryLimit { .. } => "wasm.memory_limit",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            WasmOp::Load { module } => check_module_size(module),
            WasmOp::Call {
                module,
                function,
                fuel,
                capabilities,
                ..
            } => {
                if function.trim().is_empty() {
                    return Err(EngineError::InvalidParameters("function must not be empty".into()));
                }
                if *fuel == Some(0) {
                    return Err(EngineError::InvalidParameters("fuel must be greater than zero".into()));
                }
                if let ModuleSource::Inline { wasm } = module {
                    check_module_size(wasm)?;
                }
                if let Some(path) = &capabilities.input_path {
                    Workspace::clean(path)?;
                }
                if !capabilities.write_paths.is_empty() && !capabilities.workspace_io {
                    return Err(EngineError::InvalidParameters(
                        "write_paths requires workspace_io".into(),
                    ));
                }
                for path in &capabilities.write_paths {
                    if Workspace::clean(path)?.as_os_str().is_empty() {
                        return Err(EngineError::InvalidParameters(
                            "write path must name a file".into(),
                        ));
                    }
                }
                Ok(())
            }
            WasmOp::MemoryLimit { bytes } => {
                if *bytes < WASM_PAGE {
                    return Err(EngineError::InvalidParameters(
                        "memory limit must be at least one page (64KiB)".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn resource_keys(&self, workspace: &Workspace) -> Vec<String> {
        match self {
            WasmOp::Call { capabilities, .. } => {
                let mut keys: Vec<String> = capabilities
                    .input_path
                    .iter()
                    .chain(&capabilities.write_paths)
                    .map(|path| workspace.path_key(path))
                    .collect();
                keys.sort();
                keys.dedup();
                keys
            }
            _ => Vec::new(),
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        match self {
            WasmOp::Load { module } => json!({
                "op": self.name(),
                "bytes": module.byte_len().ok(),
            }),
            WasmOp::Call {
                module,
                function,
                fuel,
                capabilities,
                ..
            } => json!({
                "op": self.name(),
                "module": match module {
                    ModuleSource::Cached { module_id } => module_id.clone(),
                    ModuleSource::Inline { .. } => "inline".to_string(),
                },
                "function": function,
                "fuel": fuel,
                "capabilities": capabilities,
            }),
            WasmOp::MemoryLimit { bytes } => json!({ "op": self.name(), "bytes": bytes }),
        }
    }
}

fn check_module_size(module: &Payload) -> Result<()> {
    let size = module.byte_len()?;
    if size > MAX_MODULE_BYTES {
        return Err(EngineError::SizeExceeded {
            size: size as u64,
            limit: MAX_MODULE_BYTES as u64,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmExport {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WasmOutput {
    Loaded {
        module_id: String,
        exports: Vec<WasmExport>,
    },
    Returned {
        values: Vec<WasmValue>,
        fuel_consumed: u64,
        files_written: Vec<String>,
    },
    MemoryLimitSet {
        bytes: u64,
    },
}

struct CachedModule {
    module: Module,
    loaded_at: Instant,
}

/// Per-call store data
struct HostState {
    limits: StoreLimits,
    input: Vec<u8>,
    workspace_io: Option<WorkspaceIo>,
}

struct WorkspaceIo {
    filesystem: Arc<FilesystemEngine>,
    session: SessionContext,
    max_write_bytes: u64,
    /// Cleaned `write_paths`
    writable: Vec<PathBuf>,
    pending_writes: Vec<(String, Vec<u8>)>,
}

/// WebAssembly engine
pub struct WasmEngine {
    config: WasmConfig,
    engine: Engine,
    filesystem: Arc<FilesystemEngine>,
    modules: DashMap<String, CachedModule>,
    memory_ceilings: DashMap<String, u64>,
}

impl WasmEngine {
    pub fn new(config: WasmConfig, filesystem: Arc<FilesystemEngine>) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.async_support(true);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| EngineError::Internal(format!("wasm engine init: {:#}", e)))?;

        Ok(Self {
            config,
            engine,
            filesystem,
            modules: DashMap::new(),
            memory_ceilings: DashMap::new(),
        })
    }

    /// Session memory ceiling set by `wasm.memory_limit`, or the default
    pub fn memory_limit(&self, session_id: &str) -> u64 {
        self.memory_ceilings
            .get(session_id)
            .map(|v| *v)
            .unwrap_or(self.config.default_memory_bytes)
    }

    pub fn set_memory_limit(&self, session_id: &str, bytes: u64) -> Result<u64> {
        if bytes < WASM_PAGE || bytes > self.config.max_memory_bytes {
            return Err(EngineError::InvalidParameters(format!(
                "memory limit must be between {} and {} bytes",
                WASM_PAGE, self.config.max_memory_bytes
            )));
        }
        self.memory_ceilings.insert(session_id.to_string(), bytes);
        Ok(bytes)
    }

    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    async fn compile(&self, bytes: Vec<u8>) -> Result<Module> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| EngineError::Internal(format!("wasm compiler failed: {}", e)))?
            .map_err(|e| EngineError::InvalidParameters(format!("invalid wasm module: {:#}", e)))
    }

    async fn load(&self, module: Payload) -> Result<WasmOutput> {
        let module = self.compile(module.to_bytes()?).await?;
        let exports = module
            .exports()
            .map(|export| WasmExport {
                name: export.name().to_string(),
                kind: match export.ty() {
                    ExternType::Func(_) => "func",
                    ExternType::Global(_) => "global",
                    ExternType::Table(_) => "table",
                    ExternType::Memory(_) => "memory",
                    _ => "other",
                }
                .to_string(),
            })
            .collect();

        while self.modules.len() >= self.config.max_cached_modules.max(1) {
            let oldest = self
                .modules
                .iter()
                .min_by_key(|entry| entry.value().loaded_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    self.modules.remove(&id);
                    debug!(module_id = %id, "evicted cached wasm module");
                }
                None => break,
            }
        }

        let module_id = ulid::Ulid::new().to_string();
        self.modules.insert(
            module_id.clone(),
            CachedModule {
                module,
                loaded_at: Instant::now(),
            },
        );
        Ok(WasmOutput::Loaded { module_id, exports })
    }

    async fn resolve_module(&self, source: ModuleSource) -> Result<Module> {
        match source {
            ModuleSource::Cached { module_id } => self
                .modules
                .get(&module_id)
                .map(|entry| entry.module.clone())
                .ok_or_else(|| EngineError::NotFound(format!("wasm module '{}'", module_id))),
            ModuleSource::Inline { wasm } => self.compile(wasm.to_bytes()?).await,
        }
    }

    fn linker(&self, capabilities: &WasmCapabilities) -> Result<Linker<HostState>> {
        let mut linker = Linker::new(&self.engine);
        let define = |e: wasmtime::Error| EngineError::Internal(format!("host import: {:#}", e));

        if capabilities.input_path.is_some() {
            linker
                .func_wrap("sandbox", "input_len", |caller: Caller<'_, HostState>| -> i32 {
                    caller.data().input.len() as i32
                })
                .map_err(define)?;
            linker
                .func_wrap(
                    "sandbox",
                    "read_input",
                    |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
                        let input = std::mem::take(&mut caller.data_mut().input);
                        let count = input.len().min(len.max(0) as usize);
                        let written = write_guest(&mut caller, ptr, &input[..count]);
                        caller.data_mut().input = input;
                        if written {
                            count as i32
                        } else {
                            ERR_DENIED
                        }
                    },
                )
                .map_err(define)?;
        }

        if capabilities.workspace_io {
            linker
                .func_wrap_async(
                    "workspace",
                    "read",
                    |mut caller: Caller<'_, HostState>,
                     (path_ptr, path_len, buf_ptr, buf_len): (i32, i32, i32, i32)| {
                        Box::new(async move {
                            let Some(path) = read_guest_path(&mut caller, path_ptr, path_len) else {
                                return ERR_DENIED;
                            };
                            let (filesystem, workspace) = match &caller.data().workspace_io {
                                Some(io) => (Arc::clone(&io.filesystem), io.session.workspace.clone()),
                                None => return ERR_DENIED,
                            };
                            let max = buf_len.max(0) as u64;
                            let result = tokio::task::spawn_blocking(move || {
                                filesystem.read_bytes(&workspace, &path, max)
                            })
                            .await
                            .unwrap_or_else(|e| {
                                Err(EngineError::Internal(format!("workspace read failed: {}", e)))
                            });
                            match result {
                                Ok(bytes) => {
                                    if write_guest(&mut caller, buf_ptr, &bytes) {
                                        bytes.len() as i32
                                    } else {
                                        ERR_DENIED
                                    }
                                }
                                Err(err) => host_error_code(&err),
                            }
                        })
                    },
                )
                .map_err(define)?;
            linker
                .func_wrap(
                    "workspace",
                    "write",
                    |mut caller: Caller<'_, HostState>,
                     path_ptr: i32,
                     path_len: i32,
                     data_ptr: i32,
                     data_len: i32|
                     -> i32 {
                        let Some(path) = read_guest_path(&mut caller, path_ptr, path_len) else {
                            return ERR_DENIED;
                        };
                        let max = match &caller.data().workspace_io {
                            Some(io) => {
                                let declared = Workspace::clean(&path)
                                    .map(|clean| io.writable.contains(&clean))
                                    .unwrap_or(false);
                                if !declared {
                                    return ERR_DENIED;
                                }
                                io.max_write_bytes
                            }
                            None => return ERR_DENIED,
                        };
                        if data_len < 0 || data_len as u64 > max {
                            return ERR_TOO_LARGE;
                        }
                        let Some(data) = read_guest(&mut caller, data_ptr, data_len) else {
                            return ERR_DENIED;
                        };
                        match caller.data_mut().workspace_io.as_mut() {
                            Some(io) => {
                                io.pending_writes.push((path, data));
                                0
                            }
                            None => ERR_DENIED,
                        }
                    },
                )
                .map_err(define)?;
        }

        Ok(linker)
    }

    async fn call(
        &self,
        source: ModuleSource,
        function: String,
        args: Vec<WasmValue>,
        capabilities: WasmCapabilities,
        ctx: &InvocationContext,
    ) -> Result<WasmOutput> {
        let module = self.resolve_module(source).await?;
        check_imports(&module, &capabilities)?;

        let fuel = ctx.limits.max_fuel.unwrap_or(self.config.default_fuel);
        let memory_bytes = ctx
            .limits
            .max_memory_bytes
            .unwrap_or(self.config.default_memory_bytes);

        let input = match capabilities.input_path.clone() {
            Some(path) => {
                let filesystem = Arc::clone(&self.filesystem);
                let workspace = ctx.workspace().clone();
                tokio::task::spawn_blocking(move || {
                    filesystem.read_bytes(&workspace, &path, MAX_INPUT_BYTES)
                })
                .await
                .map_err(|e| EngineError::Internal(format!("wasm input read failed: {}", e)))??
            }
            None => Vec::new(),
        };
        let workspace_io = if capabilities.workspace_io {
            let writable = capabilities
                .write_paths
                .iter()
                .map(|path| Workspace::clean(path))
                .collect::<Result<Vec<_>>>()?;
            Some(WorkspaceIo {
                filesystem: Arc::clone(&self.filesystem),
                session: ctx.session.clone(),
                max_write_bytes: ctx.limits.max_write_bytes,
                writable,
                pending_writes: Vec::new(),
            })
        } else {
            None
        };

        let state = HostState {
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_bytes as usize)
                .trap_on_grow_failure(true)
                .build(),
            input,
            workspace_io,
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(fuel)
            .map_err(|e| EngineError::Internal(format!("set fuel: {:#}", e)))?;
        store
            .fuel_async_yield_interval(Some(self.config.yield_interval.max(1)))
            .map_err(|e| EngineError::Internal(format!("yield interval: {:#}", e)))?;

        let linker = self.linker(&capabilities)?;
        let instance = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            result = linker.instantiate_async(&mut store, &module) => result,
        };
        let instance = match instance {
            Ok(instance) => instance,
            Err(err) => {
                let consumed = fuel.saturating_sub(store.get_fuel().unwrap_or(0));
                return Err(classify_failure(err, consumed, memory_bytes));
            }
        };

        let func = instance
            .get_func(&mut store, &function)
            .ok_or_else(|| EngineError::NotFound(format!("exported function '{}'", function)))?;
        let ty = func.ty(&store);
        let params = convert_params(ty.params(), &args)?;
        let mut results = vec![Val::I32(0); ty.results().len()];

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
            result = func.call_async(&mut store, &params, &mut results) => result,
        };
        let consumed = fuel.saturating_sub(store.get_fuel().unwrap_or(0));
        if let Err(err) = outcome {
            return Err(classify_failure(err, consumed, memory_bytes));
        }

        let values = results
            .iter()
            .map(convert_result)
            .collect::<Result<Vec<_>>>()?;

        let pending = store
            .data_mut()
            .workspace_io
            .as_mut()
            .map(|io| std::mem::take(&mut io.pending_writes))
            .unwrap_or_default();
        let files_written = self.commit_writes(ctx, pending).await?;

        debug!(
            task_id = %ctx.task_id,
            function = %function,
            fuel_consumed = consumed,
            elapsed = ?started.elapsed(),
            "wasm call returned"
        );

        Ok(WasmOutput::Returned {
            values,
            fuel_consumed: consumed,
            files_written,
        })
    }

    async fn commit_writes(
        &self,
        ctx: &InvocationContext,
        pending: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<String>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let filesystem = Arc::clone(&self.filesystem);
        let session = ctx.session.clone();
        let limits = ctx.limits.clone();
        tokio::task::spawn_blocking(move || {
            filesystem.write_batch(&session, &pending, &limits)?;
            let mut written: Vec<String> = Vec::with_capacity(pending.len());
            for (path, _) in pending {
                if !written.contains(&path) {
                    written.push(path);
                }
            }
            Ok(written)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("wasm write commit failed: {}", e)))?
    }
}

#[async_trait]
impl ExecutionContract for WasmEngine {
    type Op = WasmOp;

    fn kind(&self) -> EngineKind {
        EngineKind::Wasm
    }

    fn cancellation(&self) -> CancellationStrategy {
        CancellationStrategy::Cooperative
    }

    fn limits_for(
        &self,
        op: &WasmOp,
        session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits> {
        let fuel = match op {
            WasmOp::Call { fuel: Some(fuel), .. } => {
                if *fuel > self.config.max_fuel {
                    return Err(EngineError::InvalidParameters(format!(
                        "fuel {} exceeds maximum {}",
                        fuel, self.config.max_fuel
                    )));
                }
                *fuel
            }
            _ => self.config.default_fuel,
        };

        Ok(ResourceLimits {
            max_duration: effective_timeout(requested_timeout, DEFAULT_TIMEOUT, MAX_TIMEOUT)?,
            max_fuel: Some(fuel),
            max_memory_bytes: Some(self.memory_limit(&session.session_id)),
            ..ResourceLimits::default()
        })
    }

    async fn invoke(&self, op: WasmOp, ctx: InvocationContext) -> Result<EngineOutput> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let output = match op {
            WasmOp::Load { module } => self.load(module).await?,
            WasmOp::Call {
                module,
                function,
                args,
                capabilities,
                ..
            } => self.call(module, function, args, capabilities, &ctx).await?,
            WasmOp::MemoryLimit { bytes } => {
                let bytes = self.set_memory_limit(&ctx.session.session_id, bytes)?;
                info!(session = %ctx.session.session_id, bytes, "wasm memory limit set");
                WasmOutput::MemoryLimitSet { bytes }
            }
        };
        Ok(EngineOutput::Wasm(output))
    }
}

/// Reject modules that import anything the call did not grant
fn check_imports(module: &Module, capabilities: &WasmCapabilities) -> Result<()> {
    for import in module.imports() {
        let granted = match (import.module(), import.name()) {
            ("sandbox", "input_len") | ("sandbox", "read_input") => {
                capabilities.input_path.is_some()
            }
            ("workspace", "read") | ("workspace", "write") => capabilities.workspace_io,
            _ => false,
        };
        if !granted {
            return Err(EngineError::InvalidParameters(format!(
                "module imports '{}.{}' which is not granted",
                import.module(),
                import.name()
            )));
        }
    }
    Ok(())
}

fn classify_failure(err: wasmtime::Error, fuel_consumed: u64, memory_bytes: u64) -> EngineError {
    if let Some(Trap::OutOfFuel) = err.downcast_ref::<Trap>() {
        return EngineError::ResourceExceeded(format!(
            "fuel exhausted after {} units",
            fuel_consumed
        ));
    }
    let chain = format!("{:?}", err);
    if chain.contains("forcing a memory growth failure")
        || chain.contains("exceeds memory limits")
    {
        return EngineError::ResourceExceeded(format!(
            "memory limit of {} bytes exceeded",
            memory_bytes
        ));
    }
    match err.downcast_ref::<Trap>() {
        Some(trap) => EngineError::ExecutionFailed(format!("wasm trap: {}", trap)),
        None => EngineError::ExecutionFailed(format!("{:#}", err)),
    }
}

fn convert_params(types: impl ExactSizeIterator<Item = ValType>, args: &[WasmValue]) -> Result<Vec<Val>> {
    if types.len() != args.len() {
        return Err(EngineError::InvalidParameters(format!(
            "function takes {} arguments, {} given",
            types.len(),
            args.len()
        )));
    }
    types
        .zip(args)
        .enumerate()
        .map(|(idx, (ty, arg))| match (ty, arg) {
            (ValType::I32, WasmValue::I32(v)) => Ok(Val::I32(*v)),
            (ValType::I64, WasmValue::I64(v)) => Ok(Val::I64(*v)),
            (ValType::F32, WasmValue::F32(v)) => Ok(Val::F32(v.to_bits())),
            (ValType::F64, WasmValue::F64(v)) => Ok(Val::F64(v.to_bits())),
            (ty, arg) => Err(EngineError::InvalidParameters(format!(
                "argument {} is {:?}, expected {:?}",
                idx, arg, ty
            ))),
        })
        .collect()
}

fn convert_result(value: &Val) -> Result<WasmValue> {
    match value {
        Val::I32(v) => Ok(WasmValue::I32(*v)),
        Val::I64(v) => Ok(WasmValue::I64(*v)),
        Val::F32(bits) => Ok(WasmValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(WasmValue::F64(f64::from_bits(*bits))),
        _ => Err(EngineError::ExecutionFailed(
            "function returned a non-numeric value".into(),
        )),
    }
}

fn host_error_code(err: &EngineError) -> i32 {
    match err {
        EngineError::PathEscape(_) | EngineError::InvalidParameters(_) => ERR_DENIED,
        EngineError::NotFound(_) => ERR_NOT_FOUND,
        EngineError::SizeExceeded { .. } => ERR_TOO_LARGE,
        _ => ERR_IO,
    }
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let memory = caller.get_export("memory")?.into_memory()?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut buf).ok()?;
    Some(buf)
}

fn read_guest_path(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<String> {
    if len > MAX_GUEST_PATH {
        return None;
    }
    String::from_utf8(read_guest(caller, ptr, len)?).ok()
}

fn write_guest(caller: &mut Caller<'_, HostState>, ptr: i32, data: &[u8]) -> bool {
    if ptr < 0 {
        return false;
    }
    let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
        return false;
    };
    memory.write(&mut *caller, ptr as usize, data).is_ok()
}
