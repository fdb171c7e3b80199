//! In-memory eviction index over blob and manifest slots
//!
//! Rebuilt from sidecars and records when a cache opens, then kept in step
//! with every put, delete, eviction and lazy expiry. Size accounting reads
//! this index instead of walking the disk.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stow_core::Digest;

use crate::entry::CacheKey;

/// One addressable thing the cache stores
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    Blob(Digest),
    Manifest(CacheKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub slot: Slot,
    /// Bytes on disk; manifest records count as zero
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// For manifest slots, the blob the record points at
    pub blob: Option<Digest>,
}

impl IndexEntry {
    pub fn blob(
        digest: Digest,
        size: u64,
        last_accessed: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            slot: Slot::Blob(digest),
            size,
            last_accessed,
            expires_at,
            blob: None,
        }
    }

    pub fn manifest(
        key: CacheKey,
        blob: Digest,
        last_accessed: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            slot: Slot::Manifest(key),
            size: 0,
            last_accessed,
            expires_at,
            blob: Some(blob),
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self.slot, Slot::Blob(_))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct EvictionIndex {
    entries: DashMap<Slot, IndexEntry>,
}

impl EvictionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: IndexEntry) {
        self.entries.insert(entry.slot.clone(), entry);
    }

    pub fn remove(&self, slot: &Slot) -> Option<IndexEntry> {
        self.entries.remove(slot).map(|(_, entry)| entry)
    }

    pub fn get(&self, slot: &Slot) -> Option<IndexEntry> {
        self.entries.get(slot).map(|entry| entry.clone())
    }

    /// Record an access; never moves `last_accessed` backwards
    pub fn touch(&self, slot: &Slot, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(slot) {
            if at > entry.last_accessed {
                entry.last_accessed = at;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Bytes held by blobs that have not expired at `now`
    pub fn live_size(&self, now: DateTime<Utc>) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.is_blob() && !entry.is_expired_at(now))
            .map(|entry| entry.size)
            .sum()
    }

    /// Whether any manifest slot points at `digest`
    pub fn is_referenced(&self, digest: &Digest) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.blob.as_ref() == Some(digest))
    }

    pub fn blob_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_blob()).count()
    }

    pub fn manifest_count(&self) -> usize {
        self.entries.len() - self.blob_count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
