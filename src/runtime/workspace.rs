// src/runtime/workspace.rs
//! Workspace root and path confinement
//!
//! A workspace is a canonical directory scoped to one project/session.
//! Every relative path handed to an engine goes through [`Workspace::resolve`]:
//!
//! - absolute paths and `..` segments are rejected lexically
//! - the longest existing prefix is canonicalized (following symlinks) and
//!   must stay at or below the root
//! - a dangling symlink anywhere on the path is rejected

use crate::utils::errors::{EngineError, Result};
use std::path::{Component, Path, PathBuf};

/// Logical root directory of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) a workspace rooted at an absolute directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if root.is_relative() {
            return Err(EngineError::InvalidParameters(
                "workspace root must be absolute".into(),
            ));
        }
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(EngineError::WorkspaceCorrupted(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Canonical root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically clean a relative path; `"."` and `""`-like inputs collapse to the root
    pub fn clean(relative: &str) -> Result<PathBuf> {
        if relative.contains('\0') {
            return Err(EngineError::InvalidParameters("path contains NUL byte".into()));
        }
        let path = Path::new(relative);
        if path.is_absolute() {
            return Err(EngineError::PathEscape(relative.to_string()));
        }

        let mut clean = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => continue,
                Component::Normal(part) => clean.push(part),
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::PathEscape(relative.to_string()));
                }
            }
        }
        Ok(clean)
    }

    /// Resolve a relative path to a location inside the workspace
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.trim().is_empty() {
            return Err(EngineError::InvalidParameters("path must not be empty".into()));
        }
        let clean = Self::clean(relative)?;
        let joined = self.root.join(&clean);

        // Walk up to the deepest ancestor that exists on disk.
        let mut existing = joined.as_path();
        let mut remainder: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            match std::fs::symlink_metadata(existing) {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    let name = existing
                        .file_name()
                        .ok_or_else(|| EngineError::PathEscape(relative.to_string()))?;
                    remainder.push(name);
                    existing = existing
                        .parent()
                        .ok_or_else(|| EngineError::PathEscape(relative.to_string()))?;
                }
                Err(err) => return Err(EngineError::Io(err)),
            }
        }

        let canonical = match existing.canonicalize() {
            Ok(path) => path,
            // Present but unresolvable: a dangling symlink.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::PathEscape(relative.to_string()));
            }
            Err(err) => return Err(EngineError::Io(err)),
        };
        if !canonical.starts_with(&self.root) {
            return Err(EngineError::PathEscape(relative.to_string()));
        }

        let mut resolved = canonical;
        for name in remainder.into_iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    /// Resolve a directory entry without following its final component.
    ///
    /// The full path must still pass [`Workspace::resolve`], so a symlink
    /// pointing outside the root is rejected, but the returned path names
    /// the link itself. Used by delete/move, which act on the entry.
    pub fn resolve_entry(&self, relative: &str) -> Result<PathBuf> {
        let followed = self.resolve(relative)?;
        if followed == self.root {
            return Err(EngineError::InvalidParameters(
                "operation is not permitted on the workspace root".into(),
            ));
        }

        let clean = Self::clean(relative)?;
        let name = clean
            .file_name()
            .ok_or_else(|| EngineError::InvalidParameters(format!("'{}' has no file name", relative)))?;
        let parent = match clean.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                self.resolve(&parent.to_string_lossy())?
            }
            _ => self.root.clone(),
        };
        Ok(parent.join(name))
    }

    /// Serialization key for a path
    ///
    /// Keys name the location after symlinks are followed, so an alias and
    /// its target share one key. Paths that do not resolve fall back to the
    /// root plus the lexically cleaned path.
    pub fn path_key(&self, relative: &str) -> String {
        if let Ok(resolved) = self.resolve(relative) {
            return format!("fs:{}", resolved.display());
        }
        match Self::clean(relative) {
            Ok(clean) => format!("fs:{}", self.root.join(clean).display()),
            // Invalid paths are rejected at validation; give them a distinct key anyway.
            Err(_) => format!("fs:{}:invalid:{}", self.root.display(), relative),
        }
    }

    /// Path relative to the root, for reporting
    pub fn relative_display(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| absolute.display().to_string())
    }
}
