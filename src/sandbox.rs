//! Containment checks for paths derived from untrusted input.
//!
//! A [`SandboxedPath`] can only be built through [`SandboxedPath::file`] or
//! [`SandboxedPath::dir`], which canonicalize both the candidate and the root
//! and require the candidate to sit strictly below the root.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} escapes {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxedPath {
    path: PathBuf,
}

impl SandboxedPath {
    /// Validates that `candidate` is a regular file strictly inside `root`.
    pub fn file(candidate: &Path, root: &Path) -> Result<Self, SandboxError> {
        let path = contained(candidate, root)?;
        if !path.is_file() {
            return Err(SandboxError::NotAFile(path));
        }
        Ok(Self { path })
    }

    /// Validates that `candidate` is an existing directory strictly inside `root`.
    pub fn dir(candidate: &Path, root: &Path) -> Result<Self, SandboxError> {
        let path = contained(candidate, root)?;
        if !path.is_dir() {
            return Err(SandboxError::NotADirectory(path));
        }
        Ok(Self { path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for SandboxedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SandboxedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

fn contained(candidate: &Path, root: &Path) -> Result<PathBuf, SandboxError> {
    let root = canonicalize(root)?;
    let path = canonicalize(candidate)?;
    if path == root || !path.starts_with(&root) {
        return Err(SandboxError::OutsideRoot { path, root });
    }
    Ok(path)
}

fn canonicalize(path: &Path) -> Result<PathBuf, SandboxError> {
    path.canonicalize()
        .map_err(|source| SandboxError::Canonicalize {
            path: path.to_path_buf(),
            source,
        })
}

/// True when `path` canonicalizes to a location strictly inside `root`.
/// Missing paths are never inside anything.
pub fn is_within(path: &Path, root: &Path) -> bool {
    contained(path, root).is_ok()
}

/// Creates `dir` and any missing parents, never outside `root`.
///
/// The deepest existing ancestor is canonicalized and checked before anything
/// is created, and every created component is checked again, so a symlink on
/// the way cannot lead creation out of `root`. Returns the canonical directory.
pub fn create_dir_within(dir: &Path, root: &Path) -> Result<PathBuf, SandboxError> {
    let root = canonicalize(root)?;
    let dir = normalize_path(dir);

    let mut existing = dir.as_path();
    let mut missing: Vec<&OsStr> = Vec::new();
    while fs::symlink_metadata(existing).is_err() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            return Err(SandboxError::OutsideRoot { path: dir.clone(), root });
        };
        missing.push(name);
        existing = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
    }

    let mut current = canonicalize(existing)?;
    if !current.starts_with(&root) {
        return Err(SandboxError::OutsideRoot { path: current, root });
    }
    for name in missing.into_iter().rev() {
        let next = current.join(name);
        match fs::create_dir(&next) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(SandboxError::CreateDir { path: next, source }),
        }
        current = canonicalize(&next)?;
        if !current.starts_with(&root) {
            return Err(SandboxError::OutsideRoot { path: current, root });
        }
    }

    if current == root {
        return Err(SandboxError::OutsideRoot { path: current, root });
    }
    if !current.is_dir() {
        return Err(SandboxError::NotADirectory(current));
    }
    Ok(current)
}

/// Resolves `.` and `..` lexically, without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if let Some(last) = components.last() {
                    if matches!(last, Component::Normal(_)) {
                        components.pop();
                    }
                }
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}
