use std::path::Path;

use stow_core::error::{StowError, StowResult};
use stow_core::fs::temp_name;
use stow_core::Filesystem;
use tracing::warn;

/// Marker that identifies temp files in cache directories
const TEMP_MARKER: &str = ".tmp-";

/// Replace `path` with `data` so readers never observe a partial file
///
/// Writes a temp sibling `.<name>.tmp-<uuid>`, fsyncs it, renames it over
/// `path` and fsyncs the directory. The temp file is removed if any step
/// fails.
pub fn write_atomic(fs: &dyn Filesystem, path: &Path, data: &[u8]) -> StowResult<()> {
    let (dir, name) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name.to_string_lossy()),
        _ => {
            return Err(StowError::invalid_argument(
                "path",
                format!("{} has no parent directory", path.display()),
            ))
        }
    };

    fs.create_dir_all(dir)
        .map_err(|e| StowError::io(format!("Failed to create {}", dir.display()), e))?;

    let temp = dir.join(temp_name(&format!(".{}{}", name, TEMP_MARKER)));
    let result = fs
        .write_new_synced(&temp, data)
        .and_then(|()| fs.rename(&temp, path))
        .map_err(|e| StowError::io(format!("Failed to write {}", path.display()), e));

    if let Err(err) = result {
        if fs.exists(&temp) {
            if let Err(cleanup) = fs.remove_file(&temp) {
                warn!(path = %temp.display(), error = %cleanup, "Failed to remove temp file");
            }
        }
        return Err(err);
    }

    fs.sync_dir(dir)
        .map_err(|e| StowError::io(format!("Failed to sync {}", dir.display()), e))
}

/// Whether a file name was produced by [`write_atomic`]
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.contains(TEMP_MARKER))
        .unwrap_or(false)
}
