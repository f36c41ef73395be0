use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug)]
pub struct PathPolicy {
    /// Disc folders are often symlinked into a library, so this defaults to true.
    pub allow_symlinks: bool,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self { allow_symlinks: true }
    }
}

/// Ensure a source-table path is safe relative to `root`: not absolute, no
/// `..`, no prefix. With `allow_symlinks == false`, no component may be a
/// symlink either.
pub fn validate_path(root: &Path, rel: &Path, policy: PathPolicy) -> Result<PathBuf> {
    if rel.as_os_str().is_empty() {
        return Err(Error::UnsafePath("empty path".into()));
    }
    if rel.is_absolute() {
        return Err(Error::UnsafePath(format!("absolute paths are not allowed: {rel:?}")));
    }
    for comp in rel.components() {
        match comp {
            Component::ParentDir => {
                return Err(Error::UnsafePath(format!("parent traversal not allowed: {rel:?}")))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(Error::UnsafePath(format!("rooted path not allowed: {rel:?}")))
            }
            _ => {}
        }
    }
    let candidate = root.join(rel);
    if !policy.allow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in rel.components() {
            cur = cur.join(comp);
            if let Ok(m) = std::fs::symlink_metadata(&cur) {
                if m.file_type().is_symlink() {
                    return Err(Error::UnsafePath(format!(
                        "symlink in path (not following): {cur:?}"
                    )));
                }
            }
        }
    }
    Ok(candidate)
}
