//! Confinement of client-supplied paths to the project root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::errors::{PirunError, Result};

/// Symlink hops allowed while resolving one path (matches Linux `MAXSYMLINKS`).
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves paths against a canonical root and rejects anything that lands
/// outside of it.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Canonicalize `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = fs::canonicalize(root)
            .map_err(|e| PirunError::Config(format!("project root {}: {}", root.display(), e)))?;
        if !canonical.is_dir() {
            return Err(PirunError::NotADirectory(canonical.display().to_string()));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `user_path` (relative to root, or absolute) to a canonical path
    /// inside the root.
    ///
    /// Existing components have their symlinks followed; components that do
    /// not exist yet are appended lexically, so a path to a file that is about
    /// to be created still resolves. An empty path resolves to the root.
    pub fn resolve(&self, user_path: &str) -> Result<PathBuf> {
        let requested = Path::new(user_path);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let mut hops = 0;
        let resolved = resolve_lenient(&joined, &mut hops)?;

        if !resolved.starts_with(&self.root) {
            return Err(PirunError::PathEscape(user_path.to_string()));
        }
        Ok(resolved)
    }

    /// Render `abs` relative to the root, for log lines and responses.
    pub fn display_relative(&self, abs: &Path) -> String {
        abs.strip_prefix(&self.root)
            .unwrap_or(abs)
            .display()
            .to_string()
    }
}

fn resolve_lenient(path: &Path, hops: &mut usize) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                match fs::symlink_metadata(&candidate) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        *hops += 1;
                        if *hops > MAX_SYMLINK_HOPS {
                            return Err(io::Error::new(
                                io::ErrorKind::Other,
                                format!("too many levels of symbolic links: {}", candidate.display()),
                            ));
                        }
                        // `resolved` is already canonical, so a relative link
                        // target can be joined onto it directly.
                        let target = fs::read_link(&candidate)?;
                        resolved = resolve_lenient(&resolved.join(target), hops)?;
                    }
                    _ => resolved = candidate,
                }
            }
        }
    }

    Ok(resolved)
}
