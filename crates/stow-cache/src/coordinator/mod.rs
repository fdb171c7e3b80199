//! The cache coordinator: one interface over manifest records, blobs and
//! eviction
//!
//! [`Cache`] is what the client talks to. [`DiskCache`] is the production
//! implementation; [`MemoryCache`] keeps the same semantics without
//! touching the filesystem.

mod disk;
mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entry::{CacheKey, Entry};
use crate::storage::KeyGuard;
use crate::CacheResult;

pub use disk::DiskCache;
pub use memory::MemoryCache;

/// 10 GiB
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    /// The entry for `key` if present and unexpired
    ///
    /// Absent, expired and corrupt entries come back as errors for which
    /// [`is_cache_miss`](stow_core::StowError::is_cache_miss) holds.
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry>;

    /// Insert or replace; stamps `created_at`/`expires_at` and evicts
    /// until the size budget holds again
    async fn put(&self, key: &CacheKey, entry: Entry) -> CacheResult<()>;

    /// Remove the record and, unless another key still uses it, its blob.
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &CacheKey) -> CacheResult<()>;

    async fn clear(&self) -> CacheResult<()>;

    /// Bytes held by live blobs; shared blobs count once
    async fn size(&self) -> CacheResult<u64>;

    /// Exclusive hold on `key` until the guard drops
    ///
    /// Waiting stops with [`Cancelled`](stow_core::StowError::Cancelled)
    /// once `cancel` fires.
    async fn lock(&self, key: &CacheKey, cancel: &CancellationToken) -> CacheResult<KeyGuard>;

    /// Restart the short manifest TTL after the registry confirmed the
    /// recorded digest; the entry TTL is unchanged
    async fn revalidate(&self, key: &CacheKey) -> CacheResult<()>;
}

/// Size and TTL budget of a cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
    pub max_size_bytes: u64,
    /// Lifetime of an entry from its last `put`
    pub default_ttl: Duration,
    /// How long a tag's resolved digest is trusted without asking the registry
    pub manifest_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE,
            default_ttl: DEFAULT_TTL,
            manifest_ttl: DEFAULT_MANIFEST_TTL,
        }
    }
}

/// Result of a prune pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Records and blobs removed
    pub entries_removed: usize,
    /// Bytes freed
    pub freed_space: u64,
}

impl PruneResult {
    /// Format freed space in human-readable format
    pub fn format_freed_space(&self) -> String {
        format_bytes(self.freed_space)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub manifests: usize,
    pub blobs: usize,
    pub live_bytes: u64,
    pub max_bytes: u64,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
