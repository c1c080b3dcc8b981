// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate:
//!
//! 1. Built-in defaults (every section implements `Default`)
//! 2. Optional file named by `SANDBOX_CONFIG` (default `sandbox.{yaml,toml,json}`)
//! 3. Environment variables, e.g. `SANDBOX__DISPATCHER__WORKERS=8`

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling for a single filesystem write
pub const DEFAULT_MAX_WRITE_BYTES: u64 = 512 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub dispatcher: DispatcherConfig,
    pub workspace: WorkspaceConfig,
    pub filesystem: FilesystemConfig,
    pub process: ProcessConfig,
    pub wasm: WasmConfig,
    pub micro: MicroConfig,
    pub quotas: QuotaConfig,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from the default file location and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("SANDBOX_CONFIG").unwrap_or_else(|_| "sandbox".to_string());
        Self::load_from(&path)
    }

    /// Load from an explicit file (extension optional) and environment
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("SANDBOX")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("process.allowed_commands")
                    .with_list_parse_key("process.env_allowlist")
                    .with_list_parse_key("process.env_denylist"),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.workers == 0 {
            return Err(EngineError::ConfigError(
                "dispatcher.workers must be greater than zero".into(),
            ));
        }
        if self.filesystem.max_write_bytes == 0 {
            return Err(EngineError::ConfigError(
                "filesystem.max_write_bytes must be greater than zero".into(),
            ));
        }
        if self.process.max_output_bytes == 0 || self.micro.max_output_bytes == 0 {
            return Err(EngineError::ConfigError(
                "output caps must be greater than zero".into(),
            ));
        }
        if self.process.max_timeout_secs < self.process.default_timeout_secs {
            return Err(EngineError::ConfigError(
                "process.max_timeout_secs must be >= process.default_timeout_secs".into(),
            ));
        }
        if self.micro.max_timeout_secs < self.micro.default_timeout_secs {
            return Err(EngineError::ConfigError(
                "micro.max_timeout_secs must be >= micro.default_timeout_secs".into(),
            ));
        }
        if self.wasm.default_fuel == 0 || self.wasm.default_fuel > self.wasm.max_fuel {
            return Err(EngineError::ConfigError(
                "wasm.default_fuel must be in 1..=wasm.max_fuel".into(),
            ));
        }
        if self.wasm.default_memory_bytes > self.wasm.max_memory_bytes {
            return Err(EngineError::ConfigError(
                "wasm.default_memory_bytes must be <= wasm.max_memory_bytes".into(),
            ));
        }
        if self.micro.pool_capacity == 0 {
            return Err(EngineError::ConfigError(
                "micro.pool_capacity must be greater than zero".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for image in &self.micro.images {
            image.validate()?;
            if !seen.insert(image.name.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "duplicate micro image '{}'",
                    image.name
                )));
            }
        }
        Ok(())
    }
}

/// RPC listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6813,
        }
    }
}

/// Task dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Fixed worker parallelism N
    pub workers: usize,

    /// Terminal tasks kept for `status`/`history`
    pub history_capacity: usize,

    /// Slack added on top of a task's own deadline before the watchdog fires
    pub watchdog_grace_ms: u64,

    /// First retry delay for transient failures
    pub retry_backoff_ms: u64,

    /// Random spread added to the retry delay
    pub retry_jitter_ms: u64,

    /// Buffered events per subscriber on the event bus
    pub event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            history_capacity: 128,
            watchdog_grace_ms: 2_000,
            retry_backoff_ms: 200,
            retry_jitter_ms: 100,
            event_buffer: 1_024,
        }
    }
}

impl DispatcherConfig {
    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }
}

/// Where per-project workspaces live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("sandbox-engine").join("workspaces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub max_write_bytes: u64,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            max_write_bytes: DEFAULT_MAX_WRITE_BYTES,
        }
    }
}

/// Process runtime engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Commands callers may run, by name or absolute path
    pub allowed_commands: Vec<String>,

    /// When non-empty, caller env keys must appear here
    pub env_allowlist: Vec<String>,

    /// Caller env keys that are always rejected
    pub env_denylist: Vec<String>,

    /// Environment every child starts from
    pub base_env: HashMap<String, String>,

    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,

    /// Per-stream capture cap
    pub max_output_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        let mut base_env = HashMap::new();
        base_env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        base_env.insert("LANG".to_string(), "C.UTF-8".to_string());

        Self {
            allowed_commands: ["sh", "ls", "cat", "echo", "python3", "node", "cargo", "git"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env_allowlist: vec![],
            env_denylist: [
                "LD_PRELOAD",
                "LD_LIBRARY_PATH",
                "LD_AUDIT",
                "DYLD_INSERT_LIBRARIES",
                "DYLD_LIBRARY_PATH",
                "BASH_ENV",
                "ENV",
                "PROMPT_COMMAND",
                "PYTHONSTARTUP",
                "NODE_OPTIONS",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            base_env,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// WebAssembly engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    pub default_fuel: u64,
    pub max_fuel: u64,
    pub default_memory_bytes: u64,
    pub max_memory_bytes: u64,

    /// Fuel units between cancellation checks
    pub yield_interval: u64,

    pub max_cached_modules: usize,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            default_fuel: 10_000_000,
            max_fuel: 1_000_000_000,
            default_memory_bytes: 16 * 1024 * 1024,
            max_memory_bytes: 256 * 1024 * 1024,
            yield_interval: 10_000,
            max_cached_modules: 64,
        }
    }
}

/// A runtime image the micro-VM pool can boot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroImageConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,

    /// Extension of the script file handed to `command`
    pub extension: String,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl MicroImageConfig {
    /// Script extension without a leading dot
    pub fn script_extension(&self) -> &str {
        self.extension.trim().trim_start_matches('.')
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.command.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "micro images need a name and a command".into(),
            ));
        }
        if self.script_extension().is_empty() {
            return Err(EngineError::ConfigError(format!(
                "micro image '{}' needs a script extension",
                self.name
            )));
        }
        Ok(())
    }
}

/// Micro-VM engine and pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroConfig {
    pub root: PathBuf,
    pub images: Vec<MicroImageConfig>,

    /// Instances per image bucket
    pub pool_capacity: usize,

    /// Instances across all buckets
    pub max_instances: usize,

    pub idle_ttl_secs: u64,

    /// How long `start` waits for a saturated bucket
    pub lease_timeout_ms: u64,

    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub base_env: HashMap<String, String>,
}

impl Default for MicroConfig {
    fn default() -> Self {
        let mut base_env = HashMap::new();
        base_env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        base_env.insert("LANG".to_string(), "C.UTF-8".to_string());

        let mut python_env = HashMap::new();
        python_env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        Self {
            root: std::env::temp_dir().join("sandbox-engine").join("micro"),
            images: vec![MicroImageConfig {
                name: "python".to_string(),
                command: "python3".to_string(),
                args: vec!["-u".to_string()],
                extension: "py".to_string(),
                env: python_env,
            }],
            pool_capacity: 4,
            max_instances: 16,
            idle_ttl_secs: 300,
            lease_timeout_ms: 5_000,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            base_env,
        }
    }
}

/// Per-session quotas enforced by the resource governor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_concurrent: usize,
    pub max_bytes_written: u64,
    pub max_cpu_time_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_bytes_written: 256 * 1024 * 1024,
            max_cpu_time_secs: 3_600,
        }
    }
}

/// LLM collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Accept agent tasks at all
    pub enabled: bool,
    pub llm_endpoint: String,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub max_context_bytes: usize,
    pub api_key: Option<String>,

    /// Starting token balance of each user in the in-memory ledger
    pub token_allowance: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            llm_endpoint: "http://127.0.0.1:11434".to_string(),
            default_model: "default".to_string(),
            request_timeout_secs: 30,
            max_context_bytes: 512 * 1024,
            api_key: None,
            token_allowance: 1_000_000,
        }
    }
}

/// A principal behind a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub user_id: String,
    pub project: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: HashMap<String, TokenGrant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}
