// src/runtime/filesystem.rs
//! Filesystem engine
//!
//! Path-scoped file operations on a session workspace. All I/O is blocking
//! and runs on tokio's blocking pool so dispatch stays responsive.
//!
//! Writes are atomic:
//!
//! ```text
//! size check ──→ resolve ──→ reserve quota ──→ temp file in target dir
//!                                                 │ write + fsync
//!                                                 ▼
//!                                   rename over target ──→ commit quota
//! ```
//!
//! Nothing touches disk before the size, path and quota checks pass, and a
//! reader never observes a partially written file. Batches stage every temp
//! file before the first rename.

use crate::runtime::contract::{
    effective_timeout, CancellationStrategy, EngineKind, EngineOutput, ExecutionContract,
    InvocationContext, Payload, SessionContext,
};
use crate::runtime::resource_limiter::{ResourceGovernor, ResourceLimits};
use crate::runtime::workspace::Workspace;
use crate::utils::config::FilesystemConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const TEMP_PREFIX: &str = ".sandbox-write-";

fn default_true() -> bool {
    true
}

fn default_list_path() -> String {
    ".".to_string()
}

/// Filesystem operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsOp {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: Payload,
        #[serde(default = "default_true")]
        create_parents: bool,
    },
    List {
        #[serde(default = "default_list_path")]
        path: String,
    },
    Delete {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Move {
        from: String,
        to: String,
        #[serde(default)]
        overwrite: bool,
    },
    Copy {
        from: String,
        to: String,
        #[serde(default)]
        overwrite: bool,
    },
    Mkdir {
        path: String,
    },
}

impl FsOp {
    pub fn name(&self) -> &'static str {
        match self {
            FsOp::Read { .. } => "fs.read",
            FsOp::Write { .. } => "fs.write",
            FsOp::List { .. } => "fs.list",
            FsOp::Delete { .. } => "fs.delete",
            FsOp::Move { .. } => "fs.move",
            FsOp::Copy { .. } => "fs.copy",
            FsOp::Mkdir { .. } => "fs.mkdir",
        }
    }

    fn paths(&self) -> Vec<&str> {
        match self {
            FsOp::Read { path }
            | FsOp::Write { path, .. }
            | FsOp::List { path }
            | FsOp::Delete { path, .. }
            | FsOp::Mkdir { path } => vec![path.as_str()],
            FsOp::Move { from, to, .. } | FsOp::Copy { from, to, .. } => {
                vec![from.as_str(), to.as_str()]
            }
        }
    }

    /// Lexical checks only; symlinks are checked at execution
    pub fn validate(&self) -> Result<()> {
        for path in self.paths() {
            if path.trim().is_empty() {
                return Err(EngineError::InvalidParameters("path must not be empty".into()));
            }
            Workspace::clean(path)?;
        }
        if let FsOp::Write { content, .. } = self {
            content.byte_len()?;
        }
        Ok(())
    }

    pub fn resource_keys(&self, workspace: &Workspace) -> Vec<String> {
        let mut keys: Vec<String> = self.paths().into_iter().map(|p| workspace.path_key(p)).collect();
        keys.dedup();
        keys
    }

    pub fn summary(&self) -> serde_json::Value {
        match self {
            FsOp::Write { path, content, .. } => json!({
                "op": self.name(),
                "path": path,
                "bytes": content.byte_len().ok(),
            }),
            FsOp::Move { from, to, .. } | FsOp::Copy { from, to, .. } => json!({
                "op": self.name(),
                "from": from,
                "to": to,
            }),
            _ => json!({ "op": self.name(), "path": self.paths().first() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Filesystem operation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FsOutput {
    Content { path: String, content: Payload, size: u64 },
    Written { path: String, bytes_written: u64 },
    Listing { path: String, entries: Vec<FsEntry> },
    Deleted { path: String },
    Moved { from: String, to: String },
    Copied { from: String, to: String, bytes_copied: u64 },
    Created { path: String },
}

enum CopyStep {
    Dir(PathBuf),
    File { from: PathBuf, to: PathBuf, size: u64 },
}

/// Filesystem engine
#[derive(Clone)]
pub struct FilesystemEngine {
    config: FilesystemConfig,
    governor: Arc<ResourceGovernor>,
}

impl FilesystemEngine {
    pub fn new(config: FilesystemConfig, governor: Arc<ResourceGovernor>) -> Self {
        Self { config, governor }
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Run one operation on the calling thread
    pub fn execute(
        &self,
        op: FsOp,
        session: &SessionContext,
        limits: &ResourceLimits,
    ) -> Result<FsOutput> {
        let workspace = &session.workspace;
        match op {
            FsOp::Read { path } => {
                let bytes = self.read_bytes(workspace, &path, limits.max_output_bytes as u64)?;
                Ok(FsOutput::Content {
                    size: bytes.len() as u64,
                    content: Payload::from_bytes(bytes),
                    path,
                })
            }
            FsOp::Write {
                path,
                content,
                create_parents,
            } => {
                let bytes = content.to_bytes()?;
                let written = self.write_bytes(session, &path, &bytes, create_parents, limits)?;
                Ok(FsOutput::Written {
                    path,
                    bytes_written: written,
                })
            }
            FsOp::List { path } => {
                let entries = self.list(workspace, &path)?;
                Ok(FsOutput::Listing { path, entries })
            }
            FsOp::Delete { path, recursive } => {
                self.delete(workspace, &path, recursive)?;
                Ok(FsOutput::Deleted { path })
            }
            FsOp::Move {
                from,
                to,
                overwrite,
            } => {
                self.rename(workspace, &from, &to, overwrite)?;
                Ok(FsOutput::Moved { from, to })
            }
            FsOp::Copy {
                from,
                to,
                overwrite,
            } => {
                let bytes_copied = self.copy(session, &from, &to, overwrite)?;
                Ok(FsOutput::Copied {
                    from,
                    to,
                    bytes_copied,
                })
            }
            FsOp::Mkdir { path } => {
                self.mkdir(workspace, &path)?;
                Ok(FsOutput::Created { path })
            }
        }
    }

    /// Read a whole file, refusing anything larger than `max_bytes`
    pub fn read_bytes(&self, workspace: &Workspace, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let target = workspace.resolve(path)?;
        let meta = fs::metadata(&target).map_err(|e| map_io(e, path))?;
        if meta.is_dir() {
            return Err(EngineError::InvalidParameters(format!("'{}' is a directory", path)));
        }
        if meta.len() > max_bytes {
            return Err(EngineError::SizeExceeded {
                size: meta.len(),
                limit: max_bytes,
            });
        }
        fs::read(&target).map_err(|e| map_io(e, path))
    }

    /// Atomically replace `path` with `bytes`
    pub fn write_bytes(
        &self,
        session: &SessionContext,
        path: &str,
        bytes: &[u8],
        create_parents: bool,
        limits: &ResourceLimits,
    ) -> Result<u64> {
        let limit = limits.max_write_bytes.min(self.config.max_write_bytes);
        let size = bytes.len() as u64;
        if size > limit {
            return Err(EngineError::SizeExceeded { size, limit });
        }

        let workspace = &session.workspace;
        let target = write_target(workspace, path, create_parents)?;
        let parent = parent_dir(&target)?;

        let reservation = self.governor.reserve_bytes(&session.session_id, size)?;
        fs::create_dir_all(parent)?;
        persist_atomically(parent, &target, |file| file.write_all(bytes))?;
        reservation.commit(size);

        debug!(
            session = %session.session_id,
            path = %workspace.relative_display(&target),
            bytes = size,
            "file written"
        );
        Ok(size)
    }

    /// Replace several files as one unit
    ///
    /// Every target is checked, the whole quota reserved and every temp file
    /// staged before the first rename, so a bad path or a full quota leaves
    /// the workspace untouched. A later write to the same path replaces an
    /// earlier one.
    pub fn write_batch(
        &self,
        session: &SessionContext,
        files: &[(String, Vec<u8>)],
        limits: &ResourceLimits,
    ) -> Result<u64> {
        let limit = limits.max_write_bytes.min(self.config.max_write_bytes);
        let workspace = &session.workspace;

        let mut planned: Vec<(PathBuf, &[u8])> = Vec::with_capacity(files.len());
        for (path, bytes) in files {
            let size = bytes.len() as u64;
            if size > limit {
                return Err(EngineError::SizeExceeded { size, limit });
            }
            let target = write_target(workspace, path, true)?;
            planned.retain(|(existing, _)| existing != &target);
            planned.push((target, bytes.as_slice()));
        }
        for (target, _) in &planned {
            if planned
                .iter()
                .any(|(other, _)| other != target && other.starts_with(target))
            {
                return Err(EngineError::InvalidParameters(format!(
                    "'{}' is written as both a file and a directory",
                    workspace.relative_display(target)
                )));
            }
        }

        let total: u64 = planned.iter().map(|(_, bytes)| bytes.len() as u64).sum();
        let reservation = self.governor.reserve_bytes(&session.session_id, total)?;
        let mut staged = Vec::with_capacity(planned.len());
        for (target, bytes) in &planned {
            let parent = parent_dir(target)?;
            fs::create_dir_all(parent)?;
            staged.push((stage(parent, |file| file.write_all(bytes))?, target));
        }
        for (temp, target) in staged {
            temp.persist(target).map_err(|e| EngineError::Io(e.error))?;
        }
        reservation.commit(total);

        debug!(
            session = %session.session_id,
            files = planned.len(),
            bytes = total,
            "batch written"
        );
        Ok(total)
    }

    fn list(&self, workspace: &Workspace, path: &str) -> Result<Vec<FsEntry>> {
        let dir = workspace.resolve(path)?;
        let meta = fs::metadata(&dir).map_err(|e| map_io(e, path))?;
        if !meta.is_dir() {
            return Err(EngineError::InvalidParameters(format!("'{}' is not a directory", path)));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let meta = fs::symlink_metadata(entry.path())?;
            let kind = if meta.file_type().is_symlink() {
                EntryKind::Symlink
            } else if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            let size = if kind == EntryKind::File { meta.len() } else { 0 };
            entries.push(FsEntry { name, kind, size });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn delete(&self, workspace: &Workspace, path: &str, recursive: bool) -> Result<()> {
        let target = workspace.resolve_entry(path)?;
        let meta = fs::symlink_metadata(&target).map_err(|e| map_io(e, path))?;
        if meta.is_dir() {
            if !recursive {
                return Err(EngineError::InvalidParameters(format!(
                    "'{}' is a directory; set recursive to delete it",
                    path
                )));
            }
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        debug!(path = %workspace.relative_display(&target), recursive, "entry deleted");
        Ok(())
    }

    fn rename(&self, workspace: &Workspace, from: &str, to: &str, overwrite: bool) -> Result<()> {
        let source = workspace.resolve_entry(from)?;
        fs::symlink_metadata(&source).map_err(|e| map_io(e, from))?;
        let target = workspace.resolve_entry(to)?;

        if target.starts_with(&source) && target != source {
            return Err(EngineError::InvalidParameters(format!(
                "cannot move '{}' into itself",
                from
            )));
        }
        if fs::symlink_metadata(&target).is_ok() && !overwrite {
            return Err(EngineError::InvalidParameters(format!("'{}' already exists", to)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target)?;
        Ok(())
    }

    fn copy(&self, session: &SessionContext, from: &str, to: &str, overwrite: bool) -> Result<u64> {
        let workspace = &session.workspace;
        let source = workspace.resolve(from)?;
        fs::metadata(&source).map_err(|e| map_io(e, from))?;
        let target = workspace.resolve_entry(to)?;

        if target.starts_with(&source) {
            return Err(EngineError::InvalidParameters(format!(
                "cannot copy '{}' into itself",
                from
            )));
        }
        let target_exists = fs::symlink_metadata(&target).is_ok();
        if target_exists && !overwrite {
            return Err(EngineError::InvalidParameters(format!("'{}' already exists", to)));
        }

        let mut steps = Vec::new();
        plan_copy(workspace.root(), &source, &target, &mut Vec::new(), &mut steps)?;
        let total: u64 = steps
            .iter()
            .map(|step| match step {
                CopyStep::File { size, .. } => *size,
                CopyStep::Dir(_) => 0,
            })
            .sum();

        let reservation = self.governor.reserve_bytes(&session.session_id, total)?;
        if target_exists && fs::symlink_metadata(&target)?.is_dir() {
            fs::remove_dir_all(&target)?;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        for step in steps {
            match step {
                CopyStep::Dir(dir) => fs::create_dir_all(&dir)?,
                CopyStep::File { from, to, .. } => {
                    let parent = to.parent().unwrap_or(workspace.root());
                    persist_atomically(parent, &to, |file| {
                        let mut source = fs::File::open(&from)?;
                        io::copy(&mut source, file).map(|_| ())
                    })?;
                }
            }
        }
        reservation.commit(total);
        Ok(total)
    }

    fn mkdir(&self, workspace: &Workspace, path: &str) -> Result<()> {
        let target = workspace.resolve(path)?;
        if target.exists() && !target.is_dir() {
            return Err(EngineError::InvalidParameters(format!("'{}' exists and is not a directory", path)));
        }
        fs::create_dir_all(&target)?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionContract for FilesystemEngine {
    type Op = FsOp;

    fn kind(&self) -> EngineKind {
        EngineKind::Filesystem
    }

    fn cancellation(&self) -> CancellationStrategy {
        CancellationStrategy::Cooperative
    }

    fn limits_for(
        &self,
        _op: &FsOp,
        _session: &SessionContext,
        requested_timeout: Option<Duration>,
    ) -> Result<ResourceLimits> {
        Ok(ResourceLimits {
            max_write_bytes: self.config.max_write_bytes,
            max_duration: effective_timeout(requested_timeout, DEFAULT_TIMEOUT, MAX_TIMEOUT)?,
            ..ResourceLimits::default()
        })
    }

    async fn invoke(&self, op: FsOp, ctx: InvocationContext) -> Result<EngineOutput> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let engine = self.clone();
        let InvocationContext {
            session, limits, ..
        } = ctx;
        let output = tokio::task::spawn_blocking(move || engine.execute(op, &session, &limits))
            .await
            .map_err(|e| EngineError::Internal(format!("filesystem worker failed: {}", e)))??;
        Ok(EngineOutput::Filesystem(output))
    }
}

/// Resolve a file to be written, refusing the root and directories
fn write_target(workspace: &Workspace, path: &str, create_parents: bool) -> Result<PathBuf> {
    let target = workspace.resolve(path)?;
    if target == workspace.root() || target.is_dir() {
        return Err(EngineError::InvalidParameters(format!("'{}' is a directory", path)));
    }
    if !create_parents && !parent_dir(&target)?.is_dir() {
        return Err(EngineError::NotFound(format!("parent directory of '{}'", path)));
    }
    Ok(target)
}

fn parent_dir(target: &Path) -> Result<&Path> {
    target.parent().ok_or_else(|| {
        EngineError::InvalidParameters(format!("'{}' has no parent", target.display()))
    })
}

/// Fill and fsync a temp file in `dir`; it is removed again if dropped
fn stage<F>(dir: &Path, fill: F) -> Result<tempfile::NamedTempFile>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let mut temp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    fill(temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

/// Write through a temp file in `dir`, fsync, then rename over `target`
fn persist_atomically<F>(dir: &Path, target: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    stage(dir, fill)?
        .persist(target)
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

/// Collect copy steps, refusing sources that leave the root or loop
fn plan_copy(
    root: &Path,
    source: &Path,
    target: &Path,
    ancestors: &mut Vec<PathBuf>,
    steps: &mut Vec<CopyStep>,
) -> Result<()> {
    let real = source
        .canonicalize()
        .map_err(|_| EngineError::PathEscape(source.display().to_string()))?;
    if !real.starts_with(root) {
        return Err(EngineError::PathEscape(source.display().to_string()));
    }
    if ancestors.contains(&real) {
        return Err(EngineError::InvalidParameters(format!(
            "symlink cycle at {}",
            source.display()
        )));
    }

    let meta = fs::metadata(&real)?;
    if meta.is_dir() {
        steps.push(CopyStep::Dir(target.to_path_buf()));
        let mut children = fs::read_dir(&real)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|entry| entry.file_name());
        ancestors.push(real);
        for child in children {
            if child.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            plan_copy(root, &child.path(), &target.join(child.file_name()), ancestors, steps)?;
        }
        ancestors.pop();
    } else if meta.is_file() {
        steps.push(CopyStep::File {
            from: real,
            to: target.to_path_buf(),
            size: meta.len(),
        });
    }
    Ok(())
}

fn map_io(err: io::Error, path: &str) -> EngineError {
    if err.kind() == io::ErrorKind::NotFound {
        EngineError::NotFound(path.to_string())
    } else {
        EngineError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::QuotaConfig;

    fn setup(max_bytes_written: u64) -> (tempfile::TempDir, FilesystemEngine, SessionContext) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path().join("ws")).unwrap();
        let governor = Arc::new(ResourceGovernor::new(QuotaConfig {
            max_bytes_written,
            ..QuotaConfig::default()
        }));
        let engine = FilesystemEngine::new(FilesystemConfig::default(), governor);
        (dir, engine, SessionContext::new("user", "session", workspace))
    }

    fn write(engine: &FilesystemEngine, session: &SessionContext, path: &str, bytes: &[u8]) -> Result<u64> {
        engine.write_bytes(session, path, bytes, true, &ResourceLimits::default())
    }

    #[test]
    fn test_write_limit_boundary() {
        let (_dir, engine, session) = setup(u64::MAX);
        let exact = vec![b'a'; 512 * 1024];
        assert_eq!(write(&engine, &session, "big.bin", &exact).unwrap(), 512 * 1024);

        let over = vec![b'a'; 512 * 1024 + 1];
        assert!(matches!(
            write(&engine, &session, "over.bin", &over),
            Err(EngineError::SizeExceeded { .. })
        ));
        assert!(!session.workspace.root().join("over.bin").exists());
    }

    #[test]
    fn test_write_creates_parents_and_read_back() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "src/deep/main.rs", b"fn main() {}").unwrap();
        let bytes = engine
            .read_bytes(&session.workspace, "src/deep/main.rs", 1024)
            .unwrap();
        assert_eq!(bytes, b"fn main() {}");
        assert_eq!(engine.governor().usage("session").bytes_written, 12);
    }

    #[test]
    fn test_escape_touches_nothing() {
        let (dir, engine, session) = setup(u64::MAX);
        assert!(matches!(
            write(&engine, &session, "../escape.txt", b"x"),
            Err(EngineError::PathEscape(_))
        ));
        assert!(!dir.path().join("escape.txt").exists());
        assert_eq!(engine.governor().usage("session").bytes_written, 0);
    }

    #[test]
    fn test_quota_rejects_before_write() {
        let (_dir, engine, session) = setup(4);
        assert!(matches!(
            write(&engine, &session, "a.txt", b"hello"),
            Err(EngineError::QuotaExceeded(_))
        ));
        assert!(!session.workspace.root().join("a.txt").exists());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (_dir, engine, session) = setup(u64::MAX);
        std::fs::create_dir(session.workspace.root().join("dir")).unwrap();
        let files = vec![
            ("a.txt".to_string(), b"first".to_vec()),
            ("dir".to_string(), b"second".to_vec()),
        ];
        assert!(matches!(
            engine.write_batch(&session, &files, &ResourceLimits::default()),
            Err(EngineError::InvalidParameters(_))
        ));
        assert!(!session.workspace.root().join("a.txt").exists());
        assert_eq!(engine.governor().usage("session").bytes_written, 0);

        let files = vec![
            ("a.txt".to_string(), b"first".to_vec()),
            ("nested/b.txt".to_string(), b"second".to_vec()),
            ("a.txt".to_string(), b"last".to_vec()),
        ];
        let written = engine
            .write_batch(&session, &files, &ResourceLimits::default())
            .unwrap();
        assert_eq!(written, 10);
        let root = session.workspace.root();
        assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"last");
        assert_eq!(std::fs::read(root.join("nested/b.txt")).unwrap(), b"second");
    }

    #[test]
    fn test_batch_quota_checked_up_front() {
        let (_dir, engine, session) = setup(8);
        let files = vec![
            ("a.txt".to_string(), b"12345".to_vec()),
            ("b.txt".to_string(), b"67890".to_vec()),
        ];
        assert!(matches!(
            engine.write_batch(&session, &files, &ResourceLimits::default()),
            Err(EngineError::QuotaExceeded(_))
        ));
        assert!(!session.workspace.root().join("a.txt").exists());
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "a.txt", b"first version").unwrap();
        write(&engine, &session, "a.txt", b"second").unwrap();
        let content = fs::read(session.workspace.root().join("a.txt")).unwrap();
        assert_eq!(content, b"second");
    }

    #[test]
    fn test_list_is_sorted_and_typed() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "b.txt", b"12").unwrap();
        write(&engine, &session, "a/inner.txt", b"1").unwrap();

        let entries = engine.list(&session.workspace, ".").unwrap();
        assert_eq!(
            entries,
            vec![
                FsEntry { name: "a".into(), kind: EntryKind::Dir, size: 0 },
                FsEntry { name: "b.txt".into(), kind: EntryKind::File, size: 2 },
            ]
        );
    }

    #[test]
    fn test_delete_directory_requires_recursive() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "dir/file.txt", b"x").unwrap();

        assert!(matches!(
            engine.delete(&session.workspace, "dir", false),
            Err(EngineError::InvalidParameters(_))
        ));
        engine.delete(&session.workspace, "dir", true).unwrap();
        assert!(!session.workspace.root().join("dir").exists());
        assert!(engine.delete(&session.workspace, ".", true).is_err());
    }

    #[test]
    fn test_move_refuses_overwrite_by_default() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "a.txt", b"a").unwrap();
        write(&engine, &session, "b.txt", b"b").unwrap();

        assert!(engine.rename(&session.workspace, "a.txt", "b.txt", false).is_err());
        engine.rename(&session.workspace, "a.txt", "b.txt", true).unwrap();
        let root = session.workspace.root();
        assert!(!root.join("a.txt").exists());
        assert_eq!(fs::read(root.join("b.txt")).unwrap(), b"a");
    }

    #[test]
    fn test_copy_directory_charges_quota() {
        let (_dir, engine, session) = setup(u64::MAX);
        write(&engine, &session, "src/a.txt", b"aaa").unwrap();
        write(&engine, &session, "src/nested/b.txt", b"bb").unwrap();

        let copied = engine.copy(&session, "src", "dst", false).unwrap();
        assert_eq!(copied, 5);
        let root = session.workspace.root();
        assert_eq!(fs::read(root.join("dst/nested/b.txt")).unwrap(), b"bb");
        assert_eq!(engine.governor().usage("session").bytes_written, 10);

        assert!(engine.copy(&session, "src", "src/inner", false).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_rejects_escaping_link_inside_tree() {
        let (dir, engine, session) = setup(u64::MAX);
        let outside = dir.path().join("secret.txt");
        fs::write(&outside, b"secret").unwrap();
        write(&engine, &session, "src/a.txt", b"a").unwrap();
        std::os::unix::fs::symlink(&outside, session.workspace.root().join("src/leak")).unwrap();

        assert!(matches!(
            engine.copy(&session, "src", "dst", false),
            Err(EngineError::PathEscape(_))
        ));
        assert!(!session.workspace.root().join("dst").exists());
    }

    #[test]
    fn test_mkdir_over_file_rejected() {
        let (_dir, engine, session) = setup(u64::MAX);
        engine.mkdir(&session.workspace, "a/b/c").unwrap();
        assert!(session.workspace.root().join("a/b/c").is_dir());

        write(&engine, &session, "file", b"x").unwrap();
        assert!(engine.mkdir(&session.workspace, "file").is_err());
    }

    #[tokio::test]
    async fn test_invoke_through_contract() {
        let (_dir, engine, session) = setup(u64::MAX);
        let limits = engine.limits_for(&FsOp::Mkdir { path: "x".into() }, &session, None).unwrap();
        let ctx = InvocationContext::detached(session.clone(), limits);
        let output = engine
            .invoke(
                FsOp::Write {
                    path: "notes.md".into(),
                    content: Payload::text("# notes"),
                    create_parents: true,
                },
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            output,
            EngineOutput::Filesystem(FsOutput::Written {
                path: "notes.md".into(),
                bytes_written: 7
            })
        );
    }
}
