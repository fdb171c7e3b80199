//! Configuration loading for stow
//!
//! This crate parses `stow.toml` and layers it with the global config
//! file, `STOW_*` environment variables and command-line flags into one
//! [`StowToml`].

pub mod merge;
pub mod toml;
pub mod units;

// Re-export main types
pub use self::merge::{ConfigLayering, ConfigLoader, ConfigSource, LoadedConfig, PROJECT_FILE};
pub use self::toml::{
    parse_stow_toml, serialize_stow_toml, CacheSection, PullSection, RegistrySection, RetrySection, StowToml,
};
pub use self::units::{parse_duration, parse_size, ByteSize};

use stow_core::error::StowError;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, StowError>;
