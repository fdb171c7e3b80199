//! Client configuration and per-call options

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stow_cache::{Cache, CacheOptions, DEFAULT_MANIFEST_TTL, DEFAULT_MAX_SIZE, DEFAULT_TTL};
use stow_registry::RetryConfig;

/// Safety limits applied while extracting a pulled bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractLimits {
    /// Regular files and symlinks
    pub max_files: u64,
    pub max_total_size: u64,
    pub max_file_size: u64,
    /// Refuse any entry with a dot-prefixed path component when false
    pub allow_hidden_files: bool,
    /// Apply the archived permission bits to extracted files
    pub preserve_permissions: bool,
    /// Only extract entries below this archive path, re-rooted at the target
    pub strip_prefix: Option<PathBuf>,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_files: 100_000,
            max_total_size: 4 * 1024 * 1024 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            allow_hidden_files: true,
            preserve_permissions: true,
            strip_prefix: None,
        }
    }
}

/// Where the client's cache lives and how big it may grow
///
/// Either an existing coordinator is supplied, or the client opens a
/// [`DiskCache`](stow_cache::DiskCache) at `cache_path`.
#[derive(Clone)]
pub struct CacheConfig {
    pub coordinator: Option<Arc<dyn Cache>>,
    pub cache_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub default_ttl: Duration,
    pub manifest_ttl: Duration,
}

impl CacheConfig {
    /// On-disk cache rooted at `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: Some(path.into()),
            ..Self::empty()
        }
    }

    /// Use an already constructed coordinator
    pub fn with_coordinator(coordinator: Arc<dyn Cache>) -> Self {
        Self {
            coordinator: Some(coordinator),
            ..Self::empty()
        }
    }

    pub fn max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn manifest_ttl(mut self, ttl: Duration) -> Self {
        self.manifest_ttl = ttl;
        self
    }

    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            max_size_bytes: self.max_size_bytes,
            default_ttl: self.default_ttl,
            manifest_ttl: self.manifest_ttl,
        }
    }

    fn empty() -> Self {
        Self {
            coordinator: None,
            cache_path: None,
            max_size_bytes: DEFAULT_MAX_SIZE,
            default_ttl: DEFAULT_TTL,
            manifest_ttl: DEFAULT_MANIFEST_TTL,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("coordinator", &self.coordinator.is_some())
            .field("cache_path", &self.cache_path)
            .field("max_size_bytes", &self.max_size_bytes)
            .field("default_ttl", &self.default_ttl)
            .field("manifest_ttl", &self.manifest_ttl)
            .finish()
    }
}

/// Per-call pull settings; unset fields fall back to the client's
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Skip the cache for this call
    pub cache_bypass: Option<bool>,
    pub limits: Option<ExtractLimits>,
    pub retry: Option<RetryConfig>,
}

impl PullOptions {
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.cache_bypass = Some(bypass);
        self
    }

    pub fn limits(mut self, limits: ExtractLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Per-call push settings; unset fields fall back to the client's
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Leave the cache alone for this call
    pub cache_bypass: Option<bool>,
    pub retry: Option<RetryConfig>,
}

impl PushOptions {
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.cache_bypass = Some(bypass);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}
