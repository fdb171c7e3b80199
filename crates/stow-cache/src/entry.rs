//! Cache keys and the entries stored under them

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stow_core::utils::fingerprint;
use stow_core::{Digest, Reference};

/// Identity of a cache slot: `"<operation>:<canonical reference>"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key under which pulls of `reference` are cached
    pub fn pull(reference: &Reference) -> Self {
        Self(format!("pull:{}", reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe name for this key's record and lock files
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached artifact: manifest metadata plus the bundle layer bytes
///
/// `size` always equals the byte length of `data`; both are private so
/// the two cannot drift apart. `created_at` and `expires_at` are stamped
/// by the cache on [`put`](crate::Cache::put).
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Digest of the layer bytes
    pub digest: Digest,
    /// Manifest digest the reference resolved to
    pub resolved_digest: Digest,
    pub media_type: String,
    /// Raw manifest bytes
    pub manifest: Bytes,
    data: Bytes,
    size: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The manifest record is past its short TTL; confirm the digest
    /// with the registry before trusting a tag
    pub needs_revalidation: bool,
}

impl Entry {
    pub fn new(
        resolved_digest: Digest,
        media_type: impl Into<String>,
        manifest: impl Into<Bytes>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let now = Utc::now();
        Self {
            digest: Digest::of(&data),
            resolved_digest,
            media_type: media_type.into(),
            manifest: manifest.into(),
            size: data.len() as u64,
            data,
            created_at: now,
            expires_at: now,
            needs_revalidation: false,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn with_times(
        mut self,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.created_at = created_at;
        self.expires_at = expires_at;
        self
    }
}
