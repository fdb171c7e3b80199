//! Command implementations and dispatch logic.
//!
//! Every handler takes the shared [`CommandContext`], which carries the
//! merged configuration and knows how to build a client or open the
//! cache from it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use stow_cache::DiskCache;
use stow_client::{CacheConfig, CancellationToken, Client, ExtractLimits};
use stow_config::{ConfigLayering, ConfigLoader, PullSection, RegistrySection, RetrySection, StowToml};
use stow_core::error::{StowError, StowResult};
use stow_core::CachePolicy;
use stow_registry::{AuthConfig, HttpRegistry, RegistryConfig, RetryConfig};
use tracing::debug;

pub mod cache;
pub mod pull;
pub mod push;


use crate::output::OutputHandler;
use crate::{Cli, Commands};

/// Shared context for all commands
pub struct CommandContext {
    pub cwd: PathBuf,
    pub output: OutputHandler,
    pub config: StowToml,
    pub auth: Option<AuthConfig>,
    /// Fired on Ctrl-C
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Load configuration for `cli` from every layer
    pub async fn load(cli: &Cli) -> StowResult<Self> {
        let cwd = std::env::current_dir().map_err(|e| StowError::io("Failed to get current directory", e))?;
        let utf8_cwd = Utf8PathBuf::from_path_buf(cwd.clone())
            .map_err(|path| StowError::config(format!("working directory {} is not valid UTF-8", path.display())))?;

        let env_overrides = ConfigLayering::collect_env_overrides();
        let loaded = ConfigLoader::new(utf8_cwd)
            .load(&env_overrides, &cli_overrides(cli))
            .await?;

        Ok(Self {
            cwd,
            output: OutputHandler::new(),
            config: loaded.config,
            auth: auth_from(cli),
            cancel: CancellationToken::new(),
        })
    }

    /// A client wired to the configured registry, retry policy, limits and cache
    pub fn client(&self) -> StowResult<Client> {
        let registry = HttpRegistry::with_config(registry_config(&self.config.registry))?;
        let policy = self.config.cache.policy_or_default();

        let mut builder = Client::builder()
            .registry(Arc::new(registry))
            .retry(retry_config(&self.config.retry))
            .limits(extract_limits(&self.config.pull))
            .cache_policy(policy);
        if policy != CachePolicy::Disabled {
            builder = builder.with_cache(self.cache_config());
        }
        if let Some(auth) = &self.auth {
            builder = builder.auth(auth.clone());
        }
        builder.build()
    }

    /// Open the configured on-disk cache directly
    pub fn open_cache(&self) -> StowResult<DiskCache> {
        let config = self.cache_config();
        let path = self.cache_path();
        debug!(path = %path.display(), "Opening cache");
        DiskCache::open(path, config.options())
    }

    fn cache_path(&self) -> PathBuf {
        let path = self.config.cache.path_or_default();
        let path = PathBuf::from(path.as_str());
        if path.is_absolute() {
            path
        } else {
            self.cwd.join(path)
        }
    }

    fn cache_config(&self) -> CacheConfig {
        let cache = &self.config.cache;
        CacheConfig::at(self.cache_path())
            .max_size_bytes(cache.max_size_or_default())
            .default_ttl(cache.ttl())
            .manifest_ttl(cache.manifest_ttl())
    }
}

/// Command-line flags as dotted configuration overrides
pub fn cli_overrides(cli: &Cli) -> HashMap<String, String> {
    let mut overrides = HashMap::new();
    if let Some(dir) = &cli.cache_dir {
        overrides.insert("cache.path".to_string(), dir.to_string_lossy().into_owned());
    }
    if let Some(policy) = &cli.cache_policy {
        overrides.insert("cache.policy".to_string(), policy.clone());
    }
    if cli.plain_http {
        overrides.insert("registry.plain_http".to_string(), "true".to_string());
    }
    if let Commands::Pull {
        max_files, max_size, ..
    } = &cli.command
    {
        if let Some(max_files) = max_files {
            overrides.insert("pull.max_files".to_string(), max_files.to_string());
        }
        if let Some(max_size) = max_size {
            overrides.insert("pull.max_total_size".to_string(), max_size.clone());
        }
    }
    overrides
}

fn auth_from(cli: &Cli) -> Option<AuthConfig> {
    if cli.token.is_none() && cli.username.is_none() {
        return None;
    }
    Some(AuthConfig {
        token: cli.token.clone(),
        username: cli.username.clone(),
        password: cli.password.clone(),
    })
}

pub fn registry_config(section: &RegistrySection) -> RegistryConfig {
    let defaults = RegistryConfig::default();
    RegistryConfig {
        plain_http: section.plain_http.unwrap_or(defaults.plain_http),
        timeout: section.timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
        user_agent: section.user_agent.clone().unwrap_or(defaults.user_agent),
        max_blob_size: defaults.max_blob_size,
    }
}

pub fn retry_config(section: &RetrySection) -> RetryConfig {
    let defaults = RetryConfig::default();
    RetryConfig {
        max_retries: section.max_retries.unwrap_or(defaults.max_retries),
        initial_delay: section
            .initial_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay),
        max_delay: section.max_delay_ms.map(Duration::from_millis).unwrap_or(defaults.max_delay),
        multiplier: section.multiplier.unwrap_or(defaults.multiplier),
    }
}

pub fn extract_limits(section: &PullSection) -> ExtractLimits {
    let defaults = ExtractLimits::default();
    ExtractLimits {
        max_files: section.max_files.unwrap_or(defaults.max_files),
        max_total_size: section
            .max_total_size
            .map(|size| size.as_u64())
            .unwrap_or(defaults.max_total_size),
        max_file_size: section
            .max_file_size
            .map(|size| size.as_u64())
            .unwrap_or(defaults.max_file_size),
        allow_hidden_files: section.allow_hidden_files.unwrap_or(defaults.allow_hidden_files),
        preserve_permissions: section.preserve_permissions.unwrap_or(defaults.preserve_permissions),
        strip_prefix: None,
    }
}

/// Dispatch a command to its handler
pub async fn dispatch_command(command: Commands, ctx: &CommandContext) -> StowResult<()> {
    match command {
        Commands::Push {
            source,
            reference,
            no_cache,
        } => {
            debug!("Pushing {} as {}", source.display(), reference);
            push::execute(source, reference, no_cache, ctx).await
        }
        Commands::Pull {
            reference,
            target,
            no_cache,
            strip_prefix,
            ..
        } => {
            debug!("Pulling {} into {}", reference, target.display());
            pull::execute(reference, target, no_cache, strip_prefix, ctx).await
        }
        Commands::Cache { action } => cache::execute(action, ctx).await,
        Commands::Version => {
            show_version(ctx);
            Ok(())
        }
    }
}

fn show_version(ctx: &CommandContext) {
    ctx.output.info(&format!("stow v{}", env!("CARGO_PKG_VERSION")));
    ctx.output.detail(&format!("Built: {}", env!("BUILD_DATE")));
    ctx.output.detail(&format!("Target: {}", env!("STOW_TARGET")));
    ctx.output.detail(&format!("Rust: {}", env!("RUSTC_VERSION")));
}
