//! Manifest records: what a key resolved to and when to re-check it
//!
//! One small JSON file per key under `manifests/<fingerprint>.json`. The
//! record carries two clocks: `revalidate_after` (the short manifest TTL;
//! past it a tag must be confirmed with the registry) and `expires_at`
//! (the entry TTL; past it the record is gone).

use std::io;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stow_core::error::StowError;
use stow_core::utils::blake3_hash;
use stow_core::{Digest, Filesystem};

use crate::entry::{CacheKey, Entry};
use crate::index::IndexEntry;
use crate::storage::{is_temp_file, list_dir, remove_file_if_present, write_atomic, CacheLayout};
use crate::CacheResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub key: CacheKey,
    /// Canonical reference the key was derived from
    pub reference: String,
    pub resolved_digest: Digest,
    pub blob_digest: Digest,
    pub media_type: String,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub manifest: Bytes,
    /// Blake3 of the manifest bytes
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub revalidate_after: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl ManifestRecord {
    pub fn new(
        key: &CacheKey,
        entry: &Entry,
        now: DateTime<Utc>,
        revalidate_after: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let reference = key
            .as_str()
            .split_once(':')
            .map(|(_, reference)| reference)
            .unwrap_or(key.as_str())
            .to_string();

        Self {
            key: key.clone(),
            reference,
            resolved_digest: entry.resolved_digest.clone(),
            blob_digest: entry.digest.clone(),
            media_type: entry.media_type.clone(),
            manifest: entry.manifest.clone(),
            checksum: blake3_hash(&entry.manifest),
            created_at: now,
            revalidate_after: revalidate_after.min(expires_at),
            expires_at,
            last_accessed: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn needs_revalidation_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.revalidate_after
    }

    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry::manifest(
            self.key.clone(),
            self.blob_digest.clone(),
            self.last_accessed,
            self.expires_at,
        )
    }

    /// Combine with verified blob bytes into the entry handed to callers
    pub fn to_entry(&self, data: Bytes, now: DateTime<Utc>) -> Entry {
        let mut entry = Entry::new(
            self.resolved_digest.clone(),
            self.media_type.clone(),
            self.manifest.clone(),
            data,
        )
        .with_times(self.created_at, self.expires_at);
        entry.needs_revalidation = self.needs_revalidation_at(now);
        entry
    }
}

fn to_base64<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    general_purpose::STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone)]
pub struct ManifestCache {
    fs: Arc<dyn Filesystem>,
    layout: CacheLayout,
}

impl ManifestCache {
    pub fn new(fs: Arc<dyn Filesystem>, layout: CacheLayout) -> Self {
        Self { fs, layout }
    }

    /// The record for `key`; unreadable or tampered records are corrupt
    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<ManifestRecord>> {
        let path = self.layout.record_path(key);
        let raw = match self.fs.read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StowError::io(format!("Failed to read {}", path.display()), e)),
        };

        let record: ManifestRecord = serde_json::from_slice(&raw).map_err(|e| StowError::CacheCorrupt {
            key: key.to_string(),
            expected: "valid manifest record".to_string(),
            actual: e.to_string(),
        })?;

        if record.key != *key {
            // Fingerprint collision; not ours
            return Ok(None);
        }

        let checksum = blake3_hash(&record.manifest);
        if checksum != record.checksum {
            return Err(StowError::CacheCorrupt {
                key: key.to_string(),
                expected: record.checksum,
                actual: checksum,
            });
        }
        Ok(Some(record))
    }

    pub fn put(&self, record: &ManifestRecord) -> CacheResult<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StowError::serialization("Failed to encode manifest record", e))?;
        write_atomic(self.fs.as_ref(), &self.layout.record_path(&record.key), &json)
    }

    pub fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        remove_file_if_present(self.fs.as_ref(), &self.layout.record_path(key))?;
        Ok(())
    }

    /// Every readable record; unreadable files are removed
    pub fn records(&self) -> CacheResult<Vec<ManifestRecord>> {
        let mut records = Vec::new();
        for path in list_dir(self.fs.as_ref(), &self.layout.manifests_dir())? {
            if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = self
                .fs
                .read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<ManifestRecord>(&raw).ok())
                .filter(|record| blake3_hash(&record.manifest) == record.checksum);
            match parsed {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(path = %path.display(), "Dropping unreadable manifest record");
                    remove_file_if_present(self.fs.as_ref(), &path)?;
                }
            }
        }
        Ok(records)
    }

    pub fn clear(&self) -> CacheResult<()> {
        let dir = self.layout.manifests_dir();
        match self.fs.remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StowError::io(format!("Failed to clear {}", dir.display()), e)),
        }
    }
}
