//! Crash-safe storage primitives
//!
//! Every file the cache writes goes through [`write_atomic`], so a crash
//! leaves either the old file, the new file, or a temp file that
//! [`recover`] sweeps up on the next open. Writers of a single key are
//! serialized by [`KeyLocks`], across tasks and across processes.
//!
//! ```text
//! <root>/blobs/sha256/<xx>/<hex>            content
//! <root>/blobs/sha256/<xx>/<hex>.meta.json  sidecar
//! <root>/manifests/<fingerprint>.json       manifest record
//! <root>/locks/<fingerprint>.lock           advisory lock files
//! ```

mod atomic;
mod lock;
mod recovery;

use std::io;
use std::path::{Path, PathBuf};

use stow_core::error::{StowError, StowResult};
use stow_core::{Digest, Filesystem};

use crate::entry::CacheKey;

pub use atomic::{is_temp_file, write_atomic};
pub use lock::{KeyGuard, KeyLocks};
pub use recovery::{recover, RecoveryReport};

/// Suffix of blob sidecar files
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Paths of everything under a cache root
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Store as blobs/sha256/ab/abcd...
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.blobs_dir().join(&hex[..2]).join(hex)
    }

    pub fn sidecar_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.blobs_dir()
            .join(&hex[..2])
            .join(format!("{}{}", hex, SIDECAR_SUFFIX))
    }

    pub fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.manifests_dir()
            .join(format!("{}.json", key.fingerprint()))
    }

    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key.fingerprint()))
    }
}

/// Children of `dir`; a missing directory has none
pub(crate) fn list_dir(fs: &dyn Filesystem, dir: &Path) -> StowResult<Vec<PathBuf>> {
    match fs.read_dir(dir) {
        Ok(children) => Ok(children),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StowError::io(format!("Failed to list {}", dir.display()), e)),
    }
}

/// Remove a file, tolerating a concurrent removal; true if this call removed it
pub(crate) fn remove_file_if_present(fs: &dyn Filesystem, path: &Path) -> StowResult<bool> {
    match fs.remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StowError::io(format!("Failed to remove {}", path.display()), e)),
    }
}
