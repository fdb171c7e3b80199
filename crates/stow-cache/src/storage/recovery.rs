//! Startup sweep of leftovers from interrupted writes

use std::path::Path;
use std::time::{Duration, SystemTime};

use stow_core::error::StowResult;
use stow_core::Filesystem;
use tracing::{debug, info};

use super::{is_temp_file, list_dir, remove_file_if_present, CacheLayout, SIDECAR_SUFFIX};

/// What a recovery pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub temp_files_removed: usize,
    /// Content files that never got a sidecar
    pub orphaned_blobs_removed: usize,
    /// Sidecars whose content file is gone
    pub orphaned_sidecars_removed: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Remove temp files and half-written blobs older than `grace`
///
/// Files younger than `grace` may belong to a writer in another process
/// and are left alone.
pub fn recover(
    fs: &dyn Filesystem,
    layout: &CacheLayout,
    grace: Duration,
    now: SystemTime,
) -> StowResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let is_old = |path: &Path| -> bool {
        fs.modified(path)
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age >= grace)
            .unwrap_or(false)
    };

    for shard in list_dir(fs, &layout.blobs_dir())? {
        if !fs.is_dir(&shard) {
            continue;
        }
        for path in list_dir(fs, &shard)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            if is_temp_file(&path) {
                if is_old(&path) && remove_file_if_present(fs, &path)? {
                    report.temp_files_removed += 1;
                }
            } else if let Some(content) = name.strip_suffix(SIDECAR_SUFFIX) {
                if !fs.exists(&shard.join(content)) && remove_file_if_present(fs, &path)? {
                    report.orphaned_sidecars_removed += 1;
                }
            } else {
                let sidecar = shard.join(format!("{}{}", name, SIDECAR_SUFFIX));
                if !fs.exists(&sidecar) && is_old(&path) && remove_file_if_present(fs, &path)? {
                    report.orphaned_blobs_removed += 1;
                }
            }
        }
    }

    for path in list_dir(fs, &layout.manifests_dir())? {
        if is_temp_file(&path) && is_old(&path) && remove_file_if_present(fs, &path)? {
            report.temp_files_removed += 1;
        }
    }

    if report.is_clean() {
        debug!(root = %layout.root().display(), "Cache recovery found nothing to clean");
    } else {
        info!(
            root = %layout.root().display(),
            temp_files = report.temp_files_removed,
            orphaned_blobs = report.orphaned_blobs_removed,
            orphaned_sidecars = report.orphaned_sidecars_removed,
            "Recovered cache after interrupted writes"
        );
    }
    Ok(report)
}
