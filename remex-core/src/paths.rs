//! Area-relative path resolution.
//!
//! Every path a peer hands us (delta targets, `view` requests) is resolved
//! through [`resolve_under`], which refuses anything that could land outside
//! the Area.

use std::path::{Component, Path, PathBuf};

use crate::error::RemexError;

/// Resolve `relative` strictly under `root`.
///
/// Rejects empty paths, absolute paths, drive prefixes and any `..`
/// component. `.` components are dropped.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf, RemexError> {
    let invalid = || RemexError::InvalidPath(relative.to_string());
    if relative.trim().is_empty() {
        return Err(invalid());
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid());
            }
        }
    }
    if depth == 0 {
        return Err(invalid());
    }
    Ok(resolved)
}

/// Like [`resolve_under`] but an empty path or `.` means `root` itself.
pub fn resolve_under_or_root(root: &Path, relative: &str) -> Result<PathBuf, RemexError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Ok(root.to_path_buf());
    }
    resolve_under(root, trimmed)
}
