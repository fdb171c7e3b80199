//! OCI content digests.
//!
//! Only `sha256` digests are produced; parsing accepts the same form and
//! rejects anything that is not 64 lowercase hex characters.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{StowError, StowResult};

const SHA256_PREFIX: &str = "sha256:";

/// An immutable content identifier (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Compute the sha256 digest of content
    pub fn of(content: &[u8]) -> Self {
        let hash = Sha256::digest(content);
        Self {
            hex: hex::encode(hash),
        }
    }

    /// Hex part of the digest, without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn algorithm(&self) -> &'static str {
        "sha256"
    }

    /// Check that content hashes to this digest
    pub fn verify(&self, content: &[u8]) -> StowResult<()> {
        let actual = Self::of(content);
        if actual == *self {
            Ok(())
        } else {
            Err(StowError::IntegrityFailure {
                subject: "content".to_string(),
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

impl FromStr for Digest {
    type Err = StowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StowError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let hex = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| invalid("digest must start with sha256:"))?;
        if hex.len() != 64 {
            return Err(invalid("sha256 digest must have 64 hex characters"));
        }
        if !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(invalid("digest must be lowercase hex"));
        }

        Ok(Self { hex: hex.to_string() })
    }
}

impl TryFrom<String> for Digest {
    type Error = StowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hex)
    }
}
