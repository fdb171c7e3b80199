//! Human-friendly sizes and durations for config values and flags

use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stow_core::error::StowError;

use crate::ConfigResult;

/// A byte count written either as an integer or as `"512MiB"`, `"10GB"` ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl<'de> Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size such as \"512MiB\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ByteSize, E> {
                u64::try_from(value)
                    .map(ByteSize)
                    .map_err(|_| E::custom("size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ByteSize, E> {
                parse_size(value).map(ByteSize).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Parse `"1024"`, `"64KB"`, `"512MiB"`, `"10G"` into bytes
///
/// Decimal (`KB`, `MB`, `GB`, `TB`) and binary (`KiB` ... `TiB`, or a bare
/// `K`/`M`/`G`/`T`) units are accepted, case-insensitively.
pub fn parse_size(input: &str) -> ConfigResult<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let invalid = || StowError::config(format!("'{}' is not a size (try 512MiB or 10GB)", input));
    let value: u64 = number.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| StowError::config(format!("'{}' is too large", input)))
}

/// Parse `"90"`, `"90s"`, `"5m"`, `"24h"` or `"7d"` into a duration
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let invalid = || StowError::config(format!("'{}' is not a duration (try 300s, 5m or 24h)", input));
    let value: u64 = number.parse().map_err(|_| invalid())?;

    let seconds = match unit.trim() {
        "" | "s" => Some(value),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(60 * 60),
        "d" => value.checked_mul(24 * 60 * 60),
        _ => return Err(invalid()),
    };
    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| StowError::config(format!("'{}' is too long", input)))
}
