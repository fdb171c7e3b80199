//! Error types and result aliases for stow operations.
//!
//! Provides a unified error type covering argument validation, cache
//! control flow, registry transport, extraction safety and local I/O.
//! Callers distinguish "go fetch it" from "something is broken" with
//! [`StowError::is_cache_miss`], and the retry executor asks
//! [`StowError::is_retryable`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The stage of a transfer in which an error surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Archive,
    Upload,
    Download,
    Extract,
    Cache,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Archive => "archive",
            Phase::Upload => "upload",
            Phase::Download => "download",
            Phase::Extract => "extract",
            Phase::Cache => "cache",
        };
        f.write_str(name)
    }
}

/// Unified error type for all stow operations
#[derive(Error, Debug)]
pub enum StowError {
    // Argument errors
    #[error("Invalid argument '{field}': {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    // Cache control flow
    #[error("Cache miss for {key}")]
    CacheMiss { key: String },

    #[error("Cache entry for {key} has expired")]
    CacheExpired { key: String },

    #[error("Cached content for {key} is corrupt: expected checksum {expected}, got {actual}")]
    CacheCorrupt {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Entry of {size} bytes exceeds the cache budget of {limit} bytes")]
    EntryTooLarge { size: u64, limit: u64 },

    #[error("Failed to lock cache slot {key}: {message}")]
    Lock { key: String, message: String },

    // Registry errors
    #[error("Artifact '{reference}' not found in registry")]
    NotFound { reference: String },

    #[error("Registry denied access to '{reference}'")]
    Unauthorized { reference: String },

    #[error("Registry returned status {status}: {message}")]
    RegistryStatus { status: u16, message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Giving up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StowError>,
    },

    #[error("Integrity check failed for {subject}: expected {expected}, got {actual}")]
    IntegrityFailure {
        subject: String,
        expected: String,
        actual: String,
    },

    // Extraction errors
    #[error("Extraction limit exceeded: {limit} is {actual}, maximum is {max}")]
    LimitExceeded { limit: String, actual: u64, max: u64 },

    #[error("Refusing unsafe archive entry {path}: {reason}")]
    UnsafeEntry { path: String, reason: String },

    #[error("Target directory {} is not empty", .path.display())]
    TargetNotEmpty { path: PathBuf },

    // Transfer wrapper
    #[error("{phase} failed for {reference}")]
    Transfer {
        reference: String,
        phase: Phase,
        #[source]
        source: Box<StowError>,
    },

    // Serialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for stow operations
pub type StowResult<T> = Result<T, StowError>;

impl StowError {
    /// Create a network error from any error type
    pub fn network<E>(message: String, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Network {
            message,
            source: Some(Box::new(source)),
        }
    }

    /// Create an IO error from std::io::Error
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a serialization error from any error type
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap this error with the reference and phase it belongs to
    pub fn in_phase(self, reference: impl Into<String>, phase: Phase) -> Self {
        match self {
            // Argument errors already name what was wrong
            err @ (Self::InvalidArgument { .. }
            | Self::InvalidReference { .. }
            | Self::TargetNotEmpty { .. }
            | Self::Transfer { .. }) => err,
            other => Self::Transfer {
                reference: reference.into(),
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Whether the retry executor may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::RegistryStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this is a cache control-flow signal rather than a failure
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            Self::CacheMiss { .. } | Self::CacheExpired { .. } | Self::CacheCorrupt { .. }
        )
    }

    /// The innermost error, looking through transfer and retry wrappers
    pub fn root(&self) -> &StowError {
        match self {
            Self::Transfer { source, .. } | Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get a user-friendly suggestion for fixing this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.root() {
            Self::InvalidReference { .. } => {
                Some("References look like registry.example.com/repo:tag or registry/repo@sha256:<hex>")
            }
            Self::NotFound { .. } => Some("Check the repository name and tag, or push the bundle first"),
            Self::Unauthorized { .. } => Some("Check the registry credentials passed to stow"),
            Self::Network { .. } | Self::Timeout { .. } => {
                Some("Check your network connection and that the registry is reachable")
            }
            Self::TargetNotEmpty { .. } => Some("Pull into a new or empty directory"),
            Self::Config { .. } => Some("Fix the named setting in stow.toml or the STOW_* environment"),
            Self::LimitExceeded { .. } => Some("Raise the pull limits if the bundle is trusted"),
            Self::Lock { .. } => Some("Another stow process may be holding the cache; retry shortly"),
            _ => None,
        }
    }
}
