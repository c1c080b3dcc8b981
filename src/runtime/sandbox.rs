// src/runtime/sandbox.rs
//! Process sandbox policy
//!
//! Decides what a child process may be started with:
//! - Command allow-list (by bare name or absolute path)
//! - Argument sanitization (no NUL bytes, bounded count and length)
//! - Environment filtering (deny-list always, allow-list when configured)
//! - Optional address-space / CPU rlimits applied in the child
//!
//! Every rejection happens before spawn.

use crate::utils::config::ProcessConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_ARGS: usize = 256;
const MAX_ARG_BYTES: usize = 16 * 1024;
const MAX_ENV_VARS: usize = 128;

/// Loader variables are dangerous under any name suffix
const DENIED_ENV_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// A command that passed the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,

    /// Full child environment: base env overlaid with the caller's
    pub env: BTreeMap<String, String>,
}

/// Command/argument/environment policy for spawned processes
pub struct SandboxPolicy {
    allowed_commands: Vec<String>,
    env_allowlist: Vec<String>,
    env_denylist: Vec<String>,
    base_env: HashMap<String, String>,

    /// Resolved executables
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl SandboxPolicy {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            allowed_commands: config.allowed_commands.clone(),
            env_allowlist: config.env_allowlist.clone(),
            env_denylist: config.env_denylist.clone(),
            base_env: config.base_env.clone(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|allowed| allowed == command)
    }

    /// Check a request against the policy and resolve its executable
    pub fn sanitize(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<SanitizedCommand> {
        if command.trim().is_empty() {
            return Err(EngineError::InvalidParameters("command must not be empty".into()));
        }
        if !self.is_allowed(command) {
            return Err(EngineError::CommandNotAllowed(command.to_string()));
        }

        check_args(args)?;
        let env = self.filter_env(env)?;
        let program = self.resolve(command)?;

        Ok(SanitizedCommand {
            program,
            args: args.to_vec(),
            env,
        })
    }

    /// Base environment plus validated caller keys
    pub fn filter_env(&self, requested: &HashMap<String, String>) -> Result<BTreeMap<String, String>> {
        if requested.len() > MAX_ENV_VARS {
            return Err(EngineError::InvalidParameters(format!(
                "at most {} environment variables are accepted",
                MAX_ENV_VARS
            )));
        }

        let mut env: BTreeMap<String, String> = self
            .base_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, value) in requested {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(EngineError::InvalidParameters(format!(
                    "malformed environment variable '{}'",
                    key
                )));
            }
            let denied = self.env_denylist.iter().any(|d| d == key)
                || DENIED_ENV_PREFIXES.iter().any(|p| key.starts_with(p));
            if denied {
                return Err(EngineError::InvalidParameters(format!(
                    "environment variable '{}' is not permitted",
                    key
                )));
            }
            if !self.env_allowlist.is_empty() && !self.env_allowlist.iter().any(|a| a == key) {
                return Err(EngineError::InvalidParameters(format!(
                    "environment variable '{}' is not in the allow-list",
                    key
                )));
            }
            env.insert(key.clone(), value.clone());
        }
        Ok(env)
    }

    fn resolve(&self, command: &str) -> Result<PathBuf> {
        if let Some(path) = self.resolved.lock().get(command) {
            return Ok(path.clone());
        }

        let path = if Path::new(command).is_absolute() {
            let path = PathBuf::from(command);
            if !path.is_file() {
                return Err(EngineError::SpawnFailed(format!("'{}' does not exist", command)));
            }
            path
        } else {
            if command.contains('/') {
                return Err(EngineError::CommandNotAllowed(command.to_string()));
            }
            let search = self.base_env.get("PATH").cloned();
            let found = match search {
                Some(paths) => which::which_in(command, Some(paths), "/"),
                None => which::which(command),
            };
            found.map_err(|e| {
                EngineError::SpawnFailed(format!("executable '{}' not found: {}", command, e))
            })?
        };

        debug!(command, path = %path.display(), "resolved executable");
        self.resolved.lock().insert(command.to_string(), path.clone());
        Ok(path)
    }
}

fn check_args(args: &[String]) -> Result<()> {
    if args.len() > MAX_ARGS {
        return Err(EngineError::InvalidParameters(format!(
            "at most {} arguments are accepted",
            MAX_ARGS
        )));
    }
    for arg in args {
        if arg.contains('\0') {
            return Err(EngineError::InvalidParameters("argument contains NUL byte".into()));
        }
        if arg.len() > MAX_ARG_BYTES {
            return Err(EngineError::InvalidParameters(format!(
                "argument exceeds {} bytes",
                MAX_ARG_BYTES
            )));
        }
    }
    Ok(())
}

/// Apply address-space and CPU rlimits to the calling process.
///
/// Runs in the forked child before exec, so it only makes raw syscalls.
#[cfg(target_os = "linux")]
pub fn apply_rlimits(max_memory_bytes: Option<u64>, max_cpu_secs: Option<u64>) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = max_memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(std::io::Error::from)?;
    }
    if let Some(secs) = max_cpu_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs).map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn apply_rlimits(_max_memory_bytes: Option<u64>, _max_cpu_secs: Option<u64>) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SandboxPolicy {
        SandboxPolicy::new(&ProcessConfig::default())
    }

    #[test]
    fn test_disallowed_command_rejected() {
        let result = policy().sanitize("rm", &["-rf".into(), "/".into()], &HashMap::new());
        assert!(matches!(result, Err(EngineError::CommandNotAllowed(_))));
    }

    #[test]
    fn test_allowed_command_resolves() {
        let command = policy().sanitize("sh", &["-c".into(), "true".into()], &HashMap::new()).unwrap();
        assert!(command.program.is_absolute());
        assert_eq!(command.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_nul_argument_rejected() {
        let result = policy().sanitize("echo", &["a\0b".into()], &HashMap::new());
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
    }

    #[test]
    fn test_denied_env_keys() {
        let policy = policy();
        for key in ["LD_PRELOAD", "BASH_ENV", "LD_ANYTHING", "DYLD_FOO"] {
            let mut env = HashMap::new();
            env.insert(key.to_string(), "x".to_string());
            assert!(
                matches!(policy.filter_env(&env), Err(EngineError::InvalidParameters(_))),
                "{} should be denied",
                key
            );
        }
    }

    #[test]
    fn test_allowlist_when_configured() {
        let config = ProcessConfig {
            env_allowlist: vec!["RUST_LOG".into()],
            ..ProcessConfig::default()
        };
        let policy = SandboxPolicy::new(&config);

        let mut ok = HashMap::new();
        ok.insert("RUST_LOG".to_string(), "debug".to_string());
        assert_eq!(policy.filter_env(&ok).unwrap()["RUST_LOG"], "debug");

        let mut other = HashMap::new();
        other.insert("HOME".to_string(), "/root".to_string());
        assert!(policy.filter_env(&other).is_err());
    }

    #[test]
    fn test_relative_path_command_rejected() {
        let config = ProcessConfig {
            allowed_commands: vec!["./run.sh".into()],
            ..ProcessConfig::default()
        };
        let result = SandboxPolicy::new(&config).sanitize("./run.sh", &[], &HashMap::new());
        assert!(matches!(result, Err(EngineError::CommandNotAllowed(_))));
    }
}
