//! Content-addressed blob store
//!
//! Blobs live at `blobs/sha256/<xx>/<hex>` with a JSON sidecar recording
//! size, blake3 checksum, expiry and last access. Content is written
//! before its sidecar and removed after it, so a sidecar always describes
//! complete content.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stow_core::error::StowError;
use stow_core::utils::{blake3_hash, verify_checksum};
use stow_core::{Digest, Filesystem};
use tracing::{debug, warn};

use crate::index::IndexEntry;
use crate::storage::{list_dir, remove_file_if_present, write_atomic, CacheLayout, SIDECAR_SUFFIX};
use crate::CacheResult;

/// Sidecar stored next to each blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub digest: Digest,
    pub size: u64,
    /// Blake3 of the content
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl BlobRecord {
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry::blob(self.digest.clone(), self.size, self.last_accessed, self.expires_at)
    }
}

#[derive(Debug, Clone)]
pub struct BlobCache {
    fs: Arc<dyn Filesystem>,
    layout: CacheLayout,
}

impl BlobCache {
    pub fn new(fs: Arc<dyn Filesystem>, layout: CacheLayout) -> Self {
        Self { fs, layout }
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.fs.exists(&self.layout.sidecar_path(digest)) && self.fs.exists(&self.layout.blob_path(digest))
    }

    pub fn record(&self, digest: &Digest) -> CacheResult<Option<BlobRecord>> {
        let path = self.layout.sidecar_path(digest);
        let raw = match self.fs.read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StowError::io(format!("Failed to read {}", path.display()), e)),
        };
        match serde_json::from_slice::<BlobRecord>(&raw) {
            Ok(record) if record.digest == *digest => Ok(Some(record)),
            Ok(_) | Err(_) => Err(StowError::CacheCorrupt {
                key: digest.to_string(),
                expected: "valid sidecar".to_string(),
                actual: "unreadable sidecar".to_string(),
            }),
        }
    }

    /// Read and verify a blob
    pub fn get(&self, digest: &Digest) -> CacheResult<(BlobRecord, Bytes)> {
        let record = self.record(digest)?.ok_or_else(|| StowError::CacheMiss {
            key: digest.to_string(),
        })?;

        let path = self.layout.blob_path(digest);
        let content = match self.fs.read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StowError::CacheMiss {
                    key: digest.to_string(),
                })
            }
            Err(e) => return Err(StowError::io(format!("Failed to read {}", path.display()), e)),
        };

        if content.len() as u64 != record.size {
            warn!(digest = %digest, size = content.len(), expected = record.size, "Cached blob has the wrong size");
            return Err(StowError::CacheCorrupt {
                key: digest.to_string(),
                expected: format!("{} bytes", record.size),
                actual: format!("{} bytes", content.len()),
            });
        }
        verify_checksum(&content, &record.checksum, &digest.to_string()).map_err(|e| {
            warn!(digest = %digest, "Cached blob failed checksum verification");
            match e {
                StowError::IntegrityFailure { subject, expected, actual } => StowError::CacheCorrupt {
                    key: subject,
                    expected,
                    actual,
                },
                other => other,
            }
        })?;

        Ok((record, Bytes::from(content)))
    }

    /// Store content, or refresh the sidecar if it is already present
    ///
    /// An existing blob keeps the later of its current and new expiry.
    pub fn put(
        &self,
        digest: &Digest,
        content: &[u8],
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> CacheResult<BlobRecord> {
        let existing = match self.record(digest) {
            Ok(record) => record.filter(|_| self.fs.exists(&self.layout.blob_path(digest))),
            Err(e) if e.is_cache_miss() => None,
            Err(e) => return Err(e),
        };

        let record = match existing {
            Some(mut record) => {
                record.expires_at = record.expires_at.max(expires_at);
                record.last_accessed = now;
                debug!(digest = %digest, "Blob already cached, refreshing sidecar");
                record
            }
            None => {
                write_atomic(self.fs.as_ref(), &self.layout.blob_path(digest), content)?;
                BlobRecord {
                    digest: digest.clone(),
                    size: content.len() as u64,
                    checksum: blake3_hash(content),
                    created_at: now,
                    expires_at,
                    last_accessed: now,
                }
            }
        };

        self.write_record(&record)?;
        Ok(record)
    }

    pub fn write_record(&self, record: &BlobRecord) -> CacheResult<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StowError::serialization("Failed to encode blob sidecar", e))?;
        write_atomic(self.fs.as_ref(), &self.layout.sidecar_path(&record.digest), &json)
    }

    /// Remove a blob and its sidecar; returns the bytes freed
    pub fn remove(&self, digest: &Digest) -> CacheResult<u64> {
        let size = self
            .record(digest)
            .ok()
            .flatten()
            .map(|record| record.size)
            .unwrap_or(0);

        // Sidecar first: content without a sidecar is what recovery sweeps
        remove_file_if_present(self.fs.as_ref(), &self.layout.sidecar_path(digest))?;
        remove_file_if_present(self.fs.as_ref(), &self.layout.blob_path(digest))?;

        if let Some(shard) = self.layout.blob_path(digest).parent() {
            // Ignore errors (shard might not be empty)
            let _ = self.fs.remove_dir(shard);
        }
        Ok(size)
    }

    /// Every readable sidecar with content present
    pub fn records(&self) -> CacheResult<Vec<BlobRecord>> {
        let mut records = Vec::new();
        for shard in list_dir(self.fs.as_ref(), &self.layout.blobs_dir())? {
            if !self.fs.is_dir(&shard) {
                continue;
            }
            for path in list_dir(self.fs.as_ref(), &shard)? {
                let Some(hex) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(SIDECAR_SUFFIX))
                else {
                    continue;
                };
                let Ok(digest) = format!("sha256:{}", hex).parse::<Digest>() else {
                    continue;
                };
                match self.record(&digest) {
                    Ok(Some(record)) if self.fs.exists(&self.layout.blob_path(&digest)) => {
                        records.push(record)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Dropping unreadable blob sidecar");
                        self.remove(&digest)?;
                    }
                }
            }
        }
        Ok(records)
    }

    pub fn clear(&self) -> CacheResult<()> {
        let dir = self.layout.blobs_dir();
        match self.fs.remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StowError::io(format!("Failed to clear {}", dir.display()), e)),
        }
    }
}
