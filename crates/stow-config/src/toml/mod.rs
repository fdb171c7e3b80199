//! stow.toml parsing and serialization
//!
//! Every field is optional so layers can be merged field by field; the
//! accessors on each section fill in the built-in defaults.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use stow_core::error::StowError;
use stow_core::CachePolicy;

use crate::units::ByteSize;
use crate::ConfigResult;

/// 10 GiB
pub const DEFAULT_CACHE_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MANIFEST_TTL_SECS: u64 = 5 * 60;

/// Complete stow.toml configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StowToml {
    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub pull: PullSection,

    #[serde(default)]
    pub registry: RegistrySection,
}

/// `[cache]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Cache directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,

    /// Size budget, bytes or a size string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<ByteSize>,

    /// Entry lifetime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,

    /// How long a tag's digest is trusted without asking the registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_ttl_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<CachePolicy>,
}

/// `[retry]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

/// `[pull]` extraction limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_size: Option<ByteSize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<ByteSize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_hidden_files: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_permissions: Option<bool>,
}

/// `[registry]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    /// Talk plain HTTP (local registries)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_http: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl CacheSection {
    /// Configured cache directory, else the platform cache dir
    pub fn path_or_default(&self) -> Utf8PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::cache_dir()
            .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
            .map(|dir| dir.join("stow"))
            .unwrap_or_else(|| Utf8PathBuf::from(".stow-cache"))
    }

    pub fn max_size_or_default(&self) -> u64 {
        self.max_size.map(ByteSize::as_u64).unwrap_or(DEFAULT_CACHE_MAX_SIZE)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS))
    }

    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_ttl_secs.unwrap_or(DEFAULT_MANIFEST_TTL_SECS))
    }

    /// A configured cache defaults to caching pulls and pushes
    pub fn policy_or_default(&self) -> CachePolicy {
        self.policy.unwrap_or(CachePolicy::Enabled)
    }
}

impl StowToml {
    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merge(mut self, other: StowToml) -> StowToml {
        macro_rules! overlay {
            ($($section:ident.$field:ident),* $(,)?) => {
                $(
                    if other.$section.$field.is_some() {
                        self.$section.$field = other.$section.$field;
                    }
                )*
            };
        }

        overlay!(
            cache.path,
            cache.max_size,
            cache.ttl_secs,
            cache.manifest_ttl_secs,
            cache.policy,
            retry.max_retries,
            retry.initial_delay_ms,
            retry.max_delay_ms,
            retry.multiplier,
            pull.max_files,
            pull.max_total_size,
            pull.max_file_size,
            pull.allow_hidden_files,
            pull.preserve_permissions,
            registry.plain_http,
            registry.timeout_secs,
            registry.user_agent,
        );
        self
    }
}

/// Parse TOML string to StowToml configuration
pub fn parse_stow_toml(content: &str) -> ConfigResult<StowToml> {
    let config: StowToml = toml::from_str(content).map_err(|e| {
        let location = e
            .span()
            .map(|span| {
                let (line, column) = line_column(content, span.start);
                format!(" at line {}, column {}", line, column)
            })
            .unwrap_or_default();
        StowError::config(format!("TOML error{}: {}", location, e.message()))
    })?;

    validate_config(&config)?;
    Ok(config)
}

/// Serialize StowToml to TOML string
pub fn serialize_stow_toml(config: &StowToml) -> ConfigResult<String> {
    toml::to_string_pretty(config).map_err(|e| StowError::serialization("Failed to encode stow.toml", e))
}

/// Reject values no layer can make sense of
pub fn validate_config(config: &StowToml) -> ConfigResult<()> {
    if config.cache.max_size == Some(ByteSize(0)) {
        return Err(StowError::config("cache.max_size must be greater than zero"));
    }
    if config.cache.ttl_secs == Some(0) {
        return Err(StowError::config("cache.ttl_secs must be greater than zero"));
    }
    if let Some(multiplier) = config.retry.multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(StowError::config(format!(
                "retry.multiplier must be at least 1.0, got {}",
                multiplier
            )));
        }
    }
    if let (Some(initial), Some(max)) = (config.retry.initial_delay_ms, config.retry.max_delay_ms) {
        if initial > max {
            return Err(StowError::config(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                initial, max
            )));
        }
    }
    if config.pull.max_files == Some(0) {
        return Err(StowError::config("pull.max_files must be greater than zero"));
    }
    if config.registry.timeout_secs == Some(0) {
        return Err(StowError::config("registry.timeout_secs must be greater than zero"));
    }
    Ok(())
}

/// Load and parse stow.toml from file path
pub async fn load_from_file(path: &camino::Utf8Path) -> ConfigResult<StowToml> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StowError::io(format!("Failed to read {}", path), e))?;

    parse_stow_toml(&content).map_err(|e| match e {
        StowError::Config { message } => StowError::config(format!("In file {}: {}", path, message)),
        other => other,
    })
}

/// 1-based line and column of a byte offset
fn line_column(content: &str, offset: usize) -> (usize, usize) {
    let before = &content[..offset.min(content.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map(|i| before.len() - i).unwrap_or(before.len() + 1);
    (line, column)
}
