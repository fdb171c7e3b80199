//! Blake3 hashing utilities for local integrity checks.
//!
//! OCI digests use sha256 (see [`crate::types::Digest`]); these helpers
//! cover the cheaper checksums recorded in cache sidecars and the
//! fingerprints used to name cache files.

use crate::error::{StowError, StowResult};

/// Compute Blake3 hash of data
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    hash.to_hex().to_string()
}

/// Stable, filesystem-safe name for an arbitrary key
pub fn fingerprint(key: &str) -> String {
    blake3_hash(key.as_bytes())[..32].to_string()
}

/// Verify data against a checksum recorded earlier
pub fn verify_checksum(data: &[u8], expected: &str, subject: &str) -> StowResult<()> {
    let actual = blake3_hash(data);
    if actual == expected {
        Ok(())
    } else {
        Err(StowError::IntegrityFailure {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
