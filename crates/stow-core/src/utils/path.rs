//! Path utilities for safe archive extraction.
//!
//! Provides normalization, traversal checks and prefix stripping for
//! paths read out of untrusted archives.

use crate::error::{StowError, StowResult};
use std::path::{Component, Path, PathBuf};

/// Normalize a path by resolving . and .. components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if components.is_empty() {
                    // This would escape the base directory
                    components.push(component);
                } else {
                    components.pop();
                }
            }
            other => components.push(other),
        }
    }

    components.iter().collect()
}

/// Check if a path is safe (relative, never climbs above its base)
pub fn is_safe_path(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }

    let mut depth = 0i32;

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => return false,
        }
    }

    true
}

/// Safely join paths, preventing directory traversal
pub fn safe_join(base: &Path, path: &Path) -> StowResult<PathBuf> {
    if !is_safe_path(path) {
        return Err(StowError::UnsafeEntry {
            path: path.display().to_string(),
            reason: "path escapes the extraction directory".to_string(),
        });
    }

    Ok(base.join(normalize_path(path)))
}

/// Whether any component of the path is a dotfile
pub fn is_hidden(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => name.to_str().map(|n| n.starts_with('.')).unwrap_or(false),
        _ => false,
    })
}

/// Strip a leading path prefix; `None` when the path is outside it
pub fn strip_path_prefix(path: &Path, prefix: &Path) -> Option<PathBuf> {
    let normalized = normalize_path(path);
    let prefix = normalize_path(prefix);
    normalized
        .strip_prefix(&prefix)
        .ok()
        .filter(|rest| !rest.as_os_str().is_empty())
        .map(Path::to_path_buf)
}
