//! Cache policy selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StowError;

/// Which client operations consult and populate the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Never touch the cache
    #[default]
    Disabled,
    /// Pulls read and populate the cache, pushes refresh it
    Enabled,
    /// Only pulls use the cache
    Pull,
    /// Only pushes refresh the cache
    Push,
}

impl CachePolicy {
    pub fn caches_pull(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::Pull)
    }

    pub fn caches_push(self) -> bool {
        matches!(self, CachePolicy::Enabled | CachePolicy::Push)
    }
}

impl FromStr for CachePolicy {
    type Err = StowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(CachePolicy::Disabled),
            "enabled" | "on" => Ok(CachePolicy::Enabled),
            "pull" => Ok(CachePolicy::Pull),
            "push" => Ok(CachePolicy::Push),
            other => Err(StowError::invalid_argument(
                "cache policy",
                format!("'{}' is not one of disabled, enabled, pull, push", other),
            )),
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CachePolicy::Disabled => "disabled",
            CachePolicy::Enabled => "enabled",
            CachePolicy::Pull => "pull",
            CachePolicy::Push => "push",
        };
        f.write_str(name)
    }
}
