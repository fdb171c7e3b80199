use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stow_core::error::StowError;
use stow_core::Digest;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Cache, CacheOptions, CacheStats};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::entry::{CacheKey, Entry};
use crate::eviction::EvictionManager;
use crate::index::{IndexEntry, Slot};
use crate::storage::{KeyGuard, KeyLocks};
use crate::CacheResult;

/// In-memory cache with the same semantics as [`DiskCache`](super::DiskCache)
///
/// Nothing survives the process; key locks exclude tasks only.
#[derive(Debug)]
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    options: CacheOptions,
    eviction: EvictionManager,
    state: Mutex<MemoryState>,
    locks: KeyLocks,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<CacheKey, StoredRecord>,
    blobs: HashMap<Digest, StoredBlob>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    entry: Entry,
    revalidate_after: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    expires_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

impl MemoryState {
    fn snapshot(&self) -> Vec<IndexEntry> {
        let blobs = self.blobs.iter().map(|(digest, blob)| {
            IndexEntry::blob(digest.clone(), blob.data.len() as u64, blob.last_accessed, blob.expires_at)
        });
        let records = self.records.iter().map(|(key, record)| {
            IndexEntry::manifest(
                key.clone(),
                record.entry.digest.clone(),
                record.last_accessed,
                record.entry.expires_at,
            )
        });
        blobs.chain(records).collect()
    }

    fn is_referenced(&self, digest: &Digest) -> bool {
        self.records.values().any(|record| record.entry.digest == *digest)
    }

    fn remove_key(&mut self, key: &CacheKey) {
        if let Some(record) = self.records.remove(key) {
            if !self.is_referenced(&record.entry.digest) {
                self.blobs.remove(&record.entry.digest);
            }
        }
    }

    fn live_size(&self, now: DateTime<Utc>) -> u64 {
        self.blobs
            .values()
            .filter(|blob| now < blob.expires_at)
            .map(|blob| blob.data.len() as u64)
            .sum()
    }
}

impl MemoryCache {
    pub fn new(options: CacheOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: CacheOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            eviction: EvictionManager::new(options.max_size_bytes),
            clock,
            options,
            state: Mutex::new(MemoryState::default()),
            locks: KeyLocks::in_process(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            manifests: state.records.len(),
            blobs: state.blobs.len(),
            live_bytes: state.live_size(self.clock.now()),
            max_bytes: self.options.max_size_bytes,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(record) = state.records.get(key).cloned() else {
            return Err(StowError::CacheMiss { key: key.to_string() });
        };
        if record.entry.is_expired_at(now) {
            state.remove_key(key);
            return Err(StowError::CacheExpired { key: key.to_string() });
        }

        if let Some(blob) = state.blobs.get_mut(&record.entry.digest) {
            blob.last_accessed = blob.last_accessed.max(now);
        }
        if let Some(stored) = state.records.get_mut(key) {
            stored.last_accessed = now;
        }

        let mut entry = record.entry;
        entry.needs_revalidation = now >= record.revalidate_after;
        Ok(entry)
    }

    async fn put(&self, key: &CacheKey, entry: Entry) -> CacheResult<()> {
        if entry.size() > self.options.max_size_bytes {
            return Err(StowError::EntryTooLarge {
                size: entry.size(),
                limit: self.options.max_size_bytes,
            });
        }

        let now = self.clock.now();
        let expires_at = add_duration(now, self.options.default_ttl);
        let revalidate_after = add_duration(now, self.options.manifest_ttl).min(expires_at);
        let mut entry = entry.with_times(now, expires_at);
        entry.needs_revalidation = false;
        let digest = entry.digest.clone();

        let mut state = self.state.lock();
        let blob = state.blobs.entry(digest.clone()).or_insert_with(|| StoredBlob {
            data: entry.data().clone(),
            expires_at,
            last_accessed: now,
        });
        blob.expires_at = blob.expires_at.max(expires_at);
        blob.last_accessed = now;

        let previous = state.records.insert(
            key.clone(),
            StoredRecord {
                entry,
                revalidate_after,
                last_accessed: now,
            },
        );
        if let Some(previous) = previous {
            if previous.entry.digest != digest && !state.is_referenced(&previous.entry.digest) {
                state.blobs.remove(&previous.entry.digest);
            }
        }

        let plan = self.eviction.plan(&state.snapshot(), now, Some(&digest));
        for slot in &plan.victims {
            match slot {
                Slot::Blob(victim) => {
                    state.blobs.remove(victim);
                }
                Slot::Manifest(victim) => {
                    state.records.remove(victim);
                }
            }
        }
        if !plan.is_empty() {
            debug!(victims = plan.victims.len(), freed = plan.reclaimed_bytes, "Evicted cache entries");
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        self.state.lock().remove_key(key);
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut state = self.state.lock();
        state.records.clear();
        state.blobs.clear();
        Ok(())
    }

    async fn size(&self) -> CacheResult<u64> {
        Ok(self.state.lock().live_size(self.clock.now()))
    }

    async fn lock(&self, key: &CacheKey, cancel: &CancellationToken) -> CacheResult<KeyGuard> {
        self.locks.acquire(key, cancel).await
    }

    async fn revalidate(&self, key: &CacheKey) -> CacheResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(key)
            .ok_or_else(|| StowError::CacheMiss { key: key.to_string() })?;
        record.revalidate_after = add_duration(now, self.options.manifest_ttl).min(record.entry.expires_at);
        Ok(())
    }
}
