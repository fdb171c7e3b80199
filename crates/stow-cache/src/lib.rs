//! Crash-safe local cache for stow
//!
//! This crate stores pulled bundles on disk: content-addressed blobs with
//! blake3 sidecars, one manifest record per cache key, an in-memory
//! eviction index rebuilt on open, and per-key locks that also hold
//! across processes. Every file is replaced atomically, so a crash leaves
//! either the old entry or the new one.

pub mod blob;
pub mod clock;
pub mod coordinator;
pub mod entry;
pub mod eviction;
pub mod index;
pub mod manifest;
pub mod storage;
pub mod tag;

// Re-export main types
pub use blob::{BlobCache, BlobRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{
    format_bytes, Cache, CacheOptions, CacheStats, DiskCache, MemoryCache, PruneResult, DEFAULT_MANIFEST_TTL,
    DEFAULT_MAX_SIZE, DEFAULT_TTL,
};
pub use entry::{CacheKey, Entry};
pub use eviction::{EvictionManager, EvictionPlan};
pub use index::{EvictionIndex, IndexEntry, Slot};
pub use manifest::{ManifestCache, ManifestRecord};
pub use storage::{CacheLayout, KeyGuard, KeyLocks, RecoveryReport};
pub use tag::{Lookup, TagResolver};

use stow_core::error::StowError;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, StowError>;
