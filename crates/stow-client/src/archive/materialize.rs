//! All-or-nothing extraction into a target directory
//!
//! A bundle is unpacked into a staging directory beside the target and
//! only moved into place once every entry passed validation. On any
//! failure the staging directory and anything already moved are removed,
//! leaving the target as it was.

use std::io;
use std::path::{Path, PathBuf};

use stow_core::error::StowError;
use stow_core::Filesystem;
use tracing::{debug, warn};

use crate::archive::extract::{extract_archive, ExtractStats};
use crate::options::ExtractLimits;
use crate::ClientResult;

const STAGING_PREFIX: &str = ".stow-pull-";

/// Fail unless `target` is absent or an empty directory
pub fn ensure_clean_target(fs: &dyn Filesystem, target: &Path) -> ClientResult<()> {
    if !fs.exists(target) {
        return Ok(());
    }
    if !fs.is_dir(target) {
        return Err(StowError::TargetNotEmpty {
            path: target.to_path_buf(),
        });
    }
    let children = fs
        .read_dir(target)
        .map_err(|e| StowError::io(format!("Failed to list {}", target.display()), e))?;
    if children.is_empty() {
        Ok(())
    } else {
        Err(StowError::TargetNotEmpty {
            path: target.to_path_buf(),
        })
    }
}

/// Extract `data` into `target` through a staging directory
pub fn materialize(
    fs: &dyn Filesystem,
    data: &[u8],
    target: &Path,
    limits: &ExtractLimits,
) -> ClientResult<ExtractStats> {
    ensure_clean_target(fs, target)?;

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs.create_dir_all(parent)
        .map_err(|e| StowError::io(format!("Failed to create {}", parent.display()), e))?;
    let staging = fs
        .create_temp_dir(parent, STAGING_PREFIX)
        .map_err(|e| StowError::io(format!("Failed to create staging directory in {}", parent.display()), e))?;

    let stats = match extract_archive(fs, data, &staging, limits) {
        Ok(stats) => stats,
        Err(e) => {
            discard(fs, &staging);
            return Err(e);
        }
    };

    if !fs.exists(target) {
        if let Err(e) = fs.rename(&staging, target) {
            discard(fs, &staging);
            return Err(StowError::io(format!("Failed to move bundle into {}", target.display()), e));
        }
        debug!(target = %target.display(), files = stats.files, "Moved staging directory into place");
        return Ok(stats);
    }

    move_children(fs, &staging, target)?;
    // Every entry is in place by now; a leftover staging directory is only litter
    if let Err(e) = fs.remove_dir(&staging) {
        warn!(path = %staging.display(), error = %e, "Failed to remove emptied staging directory");
    }
    debug!(target = %target.display(), files = stats.files, "Moved staged entries into place");
    Ok(stats)
}

/// Move each top-level entry of `staging` into the existing `target`
fn move_children(fs: &dyn Filesystem, staging: &Path, target: &Path) -> ClientResult<()> {
    let children = match fs.read_dir(staging) {
        Ok(children) => children,
        Err(e) => {
            discard(fs, staging);
            return Err(StowError::io(format!("Failed to list {}", staging.display()), e));
        }
    };

    let mut moved: Vec<PathBuf> = Vec::with_capacity(children.len());
    for child in children {
        let Some(name) = child.file_name() else {
            continue;
        };
        let destination = target.join(name);
        if let Err(e) = fs.rename(&child, &destination) {
            for done in &moved {
                if let Err(cleanup) = remove_any(fs, done) {
                    warn!(path = %done.display(), error = %cleanup, "Failed to roll back moved entry");
                }
            }
            discard(fs, staging);
            return Err(StowError::io(
                format!("Failed to move {} into {}", child.display(), target.display()),
                e,
            ));
        }
        moved.push(destination);
    }
    Ok(())
}

fn remove_any(fs: &dyn Filesystem, path: &Path) -> io::Result<()> {
    match fs.remove_file(path) {
        Ok(()) => Ok(()),
        Err(_) if fs.is_dir(path) => fs.remove_dir_all(path),
        Err(e) => Err(e),
    }
}

fn discard(fs: &dyn Filesystem, staging: &Path) {
    if let Err(e) = fs.remove_dir_all(staging) {
        warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
    }
}
