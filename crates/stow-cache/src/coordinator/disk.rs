use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use stow_core::error::StowError;
use stow_core::{Digest, Filesystem, OsFs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Cache, CacheOptions, CacheStats, PruneResult};
use crate::blob::{BlobCache, BlobRecord};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::entry::{CacheKey, Entry};
use crate::eviction::{EvictionManager, EvictionPlan};
use crate::index::{EvictionIndex, Slot};
use crate::manifest::{ManifestCache, ManifestRecord};
use crate::storage::{recover, CacheLayout, KeyGuard, KeyLocks};
use crate::CacheResult;

/// Temp files younger than this may belong to a live writer
const RECOVERY_GRACE: Duration = Duration::from_secs(10 * 60);

/// On-disk cache
///
/// Mutations are serialized by an internal write lock; reads go straight
/// to the files, which are only ever replaced atomically. Each instance
/// keeps its own eviction index, rebuilt from disk on open. File I/O runs
/// on tokio's blocking pool.
#[derive(Debug)]
pub struct DiskCache {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    options: CacheOptions,
    locks: KeyLocks,
    write_lock: Mutex<()>,
}

/// Everything the blocking half of an operation touches
#[derive(Debug)]
struct Store {
    layout: CacheLayout,
    fs: Arc<dyn Filesystem>,
    blobs: BlobCache,
    manifests: ManifestCache,
    index: EvictionIndex,
    eviction: EvictionManager,
}

/// What a read found on disk
enum Read {
    Hit {
        record: ManifestRecord,
        blob: BlobRecord,
        data: Bytes,
    },
    /// Unusable entry; drop it and report `error`
    Discard {
        seen: Option<ManifestRecord>,
        corrupt_blob: Option<Digest>,
        error: StowError,
    },
}

impl DiskCache {
    /// Open (or create) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>, options: CacheOptions) -> CacheResult<Self> {
        Self::open_with(root, options, Arc::new(OsFs), Arc::new(SystemClock))
    }

    /// Open with an explicit filesystem and clock
    pub fn open_with(
        root: impl Into<PathBuf>,
        options: CacheOptions,
        fs: Arc<dyn Filesystem>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        let layout = CacheLayout::new(root);
        for dir in [layout.blobs_dir(), layout.manifests_dir(), layout.locks_dir()] {
            fs.create_dir_all(&dir)
                .map_err(|e| StowError::io(format!("Failed to create {}", dir.display()), e))?;
        }

        recover(fs.as_ref(), &layout, RECOVERY_GRACE, SystemTime::now())?;

        let store = Store {
            blobs: BlobCache::new(fs.clone(), layout.clone()),
            manifests: ManifestCache::new(fs.clone(), layout.clone()),
            index: EvictionIndex::new(),
            eviction: EvictionManager::new(options.max_size_bytes),
            layout: layout.clone(),
            fs,
        };
        store.rebuild_index()?;

        let cache = Self {
            store: Arc::new(store),
            locks: KeyLocks::with_lock_dir(layout.locks_dir()),
            write_lock: Mutex::new(()),
            clock,
            options,
        };

        info!(
            root = %cache.root().display(),
            manifests = cache.store.index.manifest_count(),
            blobs = cache.store.index.blob_count(),
            size = cache.store.index.live_size(cache.clock.now()),
            "Opened cache"
        );
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        self.store.layout.root()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn stats(&self) -> CacheStats {
        let index = &self.store.index;
        CacheStats {
            manifests: index.manifest_count(),
            blobs: index.blob_count(),
            live_bytes: index.live_size(self.clock.now()),
            max_bytes: self.options.max_size_bytes,
        }
    }

    /// Remove every expired or unreferenced record and blob now, instead
    /// of waiting for the next `get` or `put` to notice
    pub async fn prune_expired(&self) -> CacheResult<PruneResult> {
        let _write = self.write_lock.lock().await;
        let now = self.clock.now();
        let result = self
            .blocking(move |store| {
                let plan = EvictionManager::new(u64::MAX).plan(&store.index.snapshot(), now, None);
                Ok(PruneResult {
                    entries_removed: plan.victims.len(),
                    freed_space: store.apply(&plan)?,
                })
            })
            .await?;
        info!(
            removed = result.entries_removed,
            freed = %result.format_freed_space(),
            "Pruned expired cache entries"
        );
        Ok(result)
    }

    /// Run `op` against the store on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: FnOnce(&Store) -> CacheResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StowError::io("Cache task failed", io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Drop a key found expired or broken on read, unless a writer has
    /// replaced it in the meantime
    async fn discard(
        &self,
        key: &CacheKey,
        seen: Option<ManifestRecord>,
        corrupt_blob: Option<Digest>,
    ) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        let key = key.clone();
        self.blocking(move |store| store.discard(&key, seen.as_ref(), corrupt_blob.as_ref()))
            .await
    }

    /// Record an access in the index and the blob sidecar
    async fn touch(&self, record: ManifestRecord, now: DateTime<Utc>) {
        let _write = self.write_lock.lock().await;
        let digest = record.blob_digest.clone();
        let touched = self
            .blocking(move |store| {
                store.touch(&record, now);
                Ok(())
            })
            .await;
        if let Err(e) = touched {
            warn!(digest = %digest, error = %e, "Failed to record cache access");
        }
    }
}

impl Store {
    fn rebuild_index(&self) -> CacheResult<()> {
        self.index.clear();
        for record in self.blobs.records()? {
            self.index.insert(record.index_entry());
        }
        for record in self.manifests.records()? {
            if self.index.get(&Slot::Blob(record.blob_digest.clone())).is_none() {
                debug!(key = %record.key, "Dropping manifest record whose blob is gone");
                self.manifests.remove(&record.key)?;
                continue;
            }
            self.index.insert(record.index_entry());
        }
        Ok(())
    }

    fn read(&self, key: &CacheKey, now: DateTime<Utc>) -> CacheResult<Read> {
        let record = match self.manifests.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(StowError::CacheMiss { key: key.to_string() }),
            Err(e) if e.is_cache_miss() => {
                warn!(key = %key, error = %e, "Discarding corrupt manifest record");
                return Ok(Read::Discard {
                    seen: None,
                    corrupt_blob: None,
                    error: e,
                });
            }
            Err(e) => return Err(e),
        };

        if record.is_expired_at(now) {
            debug!(key = %key, expired_at = %record.expires_at, "Cache entry expired");
            return Ok(Read::Discard {
                seen: Some(record),
                corrupt_blob: None,
                error: StowError::CacheExpired { key: key.to_string() },
            });
        }

        match self.blobs.get(&record.blob_digest) {
            Ok((blob, data)) => Ok(Read::Hit { record, blob, data }),
            Err(e @ StowError::CacheCorrupt { .. }) => Ok(Read::Discard {
                corrupt_blob: Some(record.blob_digest.clone()),
                seen: Some(record),
                error: e,
            }),
            Err(e) if e.is_cache_miss() => Ok(Read::Discard {
                seen: Some(record),
                corrupt_blob: None,
                error: StowError::CacheMiss { key: key.to_string() },
            }),
            Err(e) => Err(e),
        }
    }

    fn put(
        &self,
        key: &CacheKey,
        entry: &Entry,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        revalidate_after: DateTime<Utc>,
    ) -> CacheResult<()> {
        let previous = self
            .index
            .get(&Slot::Manifest(key.clone()))
            .and_then(|slot| slot.blob);

        let blob = self.blobs.put(&entry.digest, entry.data(), now, expires_at)?;
        self.index.insert(blob.index_entry());

        let record = ManifestRecord::new(key, entry, now, revalidate_after, expires_at);
        self.manifests.put(&record)?;
        self.index.insert(record.index_entry());

        if let Some(previous) = previous.filter(|previous| *previous != entry.digest) {
            if !self.index.is_referenced(&previous) {
                self.blobs.remove(&previous)?;
                self.index.remove(&Slot::Blob(previous));
            }
        }

        let plan = self.eviction.plan(&self.index.snapshot(), now, Some(&entry.digest));
        if !plan.is_empty() {
            let freed = self.apply(&plan)?;
            info!(
                victims = plan.victims.len(),
                freed,
                size = self.index.live_size(now),
                max = self.eviction.max_size_bytes(),
                "Evicted cache entries"
            );
        }
        Ok(())
    }

    /// Remove the victims of a plan; returns bytes freed
    fn apply(&self, plan: &EvictionPlan) -> CacheResult<u64> {
        let mut freed = 0;
        for slot in &plan.victims {
            match slot {
                Slot::Blob(digest) => freed += self.blobs.remove(digest)?,
                Slot::Manifest(key) => self.manifests.remove(key)?,
            }
            self.index.remove(slot);
        }
        Ok(freed)
    }

    /// Remove a key's record, and its blob if nothing else points at it.
    /// Caller holds the write lock.
    fn remove_key(&self, key: &CacheKey, blob_hint: Option<Digest>) -> CacheResult<()> {
        let slot = Slot::Manifest(key.clone());
        let blob = self
            .index
            .get(&slot)
            .and_then(|entry| entry.blob)
            .or(blob_hint);

        self.manifests.remove(key)?;
        self.index.remove(&slot);

        if let Some(blob) = blob {
            if !self.index.is_referenced(&blob) {
                self.blobs.remove(&blob)?;
                self.index.remove(&Slot::Blob(blob));
            }
        }
        Ok(())
    }

    fn discard(
        &self,
        key: &CacheKey,
        seen: Option<&ManifestRecord>,
        corrupt_blob: Option<&Digest>,
    ) -> CacheResult<()> {
        let current = self.manifests.get(key).ok().flatten();
        let unchanged = match (seen, &current) {
            (Some(seen), Some(current)) => seen.created_at == current.created_at,
            _ => true,
        };
        if !unchanged {
            return Ok(());
        }

        if let Some(digest) = corrupt_blob {
            self.blobs.remove(digest)?;
            self.index.remove(&Slot::Blob(digest.clone()));
        }
        self.remove_key(key, seen.map(|record| record.blob_digest.clone()))
    }

    fn touch(&self, record: &ManifestRecord, now: DateTime<Utc>) {
        let slot = Slot::Manifest(record.key.clone());
        if self.index.get(&slot).is_none() {
            // Written by another process since we opened
            self.index.insert(record.index_entry());
        }
        self.index.touch(&slot, now);

        // Re-read under the lock so a concurrent put's expiry is kept
        match self.blobs.record(&record.blob_digest) {
            Ok(Some(mut blob)) => {
                blob.last_accessed = blob.last_accessed.max(now);
                self.index.insert(blob.index_entry());
                if let Err(e) = self.blobs.write_record(&blob) {
                    warn!(digest = %blob.digest, error = %e, "Failed to persist blob access time");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(digest = %record.blob_digest, error = %e, "Failed to read blob sidecar"),
        }
    }

    fn clear(&self) -> CacheResult<()> {
        self.manifests.clear()?;
        self.blobs.clear()?;
        self.index.clear();
        for dir in [self.layout.blobs_dir(), self.layout.manifests_dir()] {
            self.fs
                .create_dir_all(&dir)
                .map_err(|e| StowError::io(format!("Failed to create {}", dir.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Entry> {
        let now = self.clock.now();
        let lookup = key.clone();

        match self.blocking(move |store| store.read(&lookup, now)).await? {
            Read::Hit { record, blob, data } => {
                let entry = record.to_entry(data, now);
                self.touch(record, now).await;
                debug!(key = %key, digest = %entry.digest, size = blob.size, "Cache hit");
                Ok(entry)
            }
            Read::Discard {
                seen,
                corrupt_blob,
                error,
            } => {
                self.discard(key, seen, corrupt_blob).await?;
                Err(error)
            }
        }
    }

    async fn put(&self, key: &CacheKey, entry: Entry) -> CacheResult<()> {
        if entry.size() > self.options.max_size_bytes {
            return Err(StowError::EntryTooLarge {
                size: entry.size(),
                limit: self.options.max_size_bytes,
            });
        }

        let _write = self.write_lock.lock().await;
        let now = self.clock.now();
        let expires_at = add_duration(now, self.options.default_ttl);
        let revalidate_after = add_duration(now, self.options.manifest_ttl);

        let (digest, size) = (entry.digest.clone(), entry.size());
        let target = key.clone();
        self.blocking(move |store| store.put(&target, &entry, now, expires_at, revalidate_after))
            .await?;

        debug!(key = %key, digest = %digest, size, "Cached entry");
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        let key = key.clone();
        self.blocking(move |store| {
            let hint = store.manifests.get(&key).ok().flatten().map(|record| record.blob_digest);
            store.remove_key(&key, hint)
        })
        .await
    }

    async fn clear(&self) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        self.blocking(|store| store.clear()).await?;
        info!(root = %self.root().display(), "Cleared cache");
        Ok(())
    }

    async fn size(&self) -> CacheResult<u64> {
        Ok(self.store.index.live_size(self.clock.now()))
    }

    async fn lock(&self, key: &CacheKey, cancel: &CancellationToken) -> CacheResult<KeyGuard> {
        self.locks.acquire(key, cancel).await
    }

    async fn revalidate(&self, key: &CacheKey) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        let now = self.clock.now();
        let manifest_ttl = self.options.manifest_ttl;
        let key = key.clone();
        self.blocking(move |store| {
            let mut record = store
                .manifests
                .get(&key)?
                .ok_or_else(|| StowError::CacheMiss { key: key.to_string() })?;
            record.revalidate_after = add_duration(now, manifest_ttl).min(record.expires_at);
            store.manifests.put(&record)?;
            debug!(key = %key, until = %record.revalidate_after, "Revalidated manifest record");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests;
