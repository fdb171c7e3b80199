//! Configuration layering, fallback logic, and environment overrides
//!
//! Layers, lowest priority first: built-in defaults, the global
//! `config.toml`, the nearest project `stow.toml`, `STOW_*` environment
//! variables, then command-line flags.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use stow_core::error::StowError;
use stow_core::CachePolicy;
use tracing::debug;

use crate::toml::{load_from_file, validate_config, StowToml};
use crate::units::{parse_duration, parse_size, ByteSize};
use crate::ConfigResult;

/// Name of the project configuration file
pub const PROJECT_FILE: &str = "stow.toml";

/// Main configuration loading interface
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Current working directory
    cwd: Utf8PathBuf,
    /// Global config file, if the platform has a config dir
    global_path: Option<Utf8PathBuf>,
}

/// Configuration layering and merging
pub struct ConfigLayering;

/// Configuration source tracking
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Global config file
    Global(Utf8PathBuf),
    /// Project stow.toml file
    Project(Utf8PathBuf),
    /// Environment variable
    Environment(String),
    /// CLI flag
    CommandLine,
}

/// The merged configuration and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: StowToml,
    pub sources: Vec<ConfigSource>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new(cwd: Utf8PathBuf) -> Self {
        Self {
            cwd,
            global_path: default_global_path(),
        }
    }

    /// Use `path` (or nothing) as the global config file
    pub fn with_global_path(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.global_path = path;
        self
    }

    /// Find configuration file in project (walks up directory tree)
    pub fn resolve_config_path(&self, filename: &str) -> Option<Utf8PathBuf> {
        let mut current = Some(self.cwd.as_path());
        while let Some(dir) = current {
            let candidate = dir.join(filename);
            if candidate.is_file() {
                return Some(candidate);
            }
            current = dir.parent();
        }
        None
    }

    /// Load the nearest project stow.toml, if any
    pub async fn load_project_config(&self) -> ConfigResult<Option<(StowToml, ConfigSource)>> {
        match self.resolve_config_path(PROJECT_FILE) {
            Some(path) => {
                let config = load_from_file(&path).await?;
                Ok(Some((config, ConfigSource::Project(path))))
            }
            None => Ok(None),
        }
    }

    /// Load global configuration
    pub async fn load_global_config(&self) -> ConfigResult<Option<(StowToml, ConfigSource)>> {
        match &self.global_path {
            Some(path) if path.is_file() => {
                let config = load_from_file(path).await?;
                Ok(Some((config, ConfigSource::Global(path.clone()))))
            }
            _ => Ok(None),
        }
    }

    /// Load every layer and merge them
    pub async fn load(
        &self,
        env_overrides: &HashMap<String, String>,
        cli_overrides: &HashMap<String, String>,
    ) -> ConfigResult<LoadedConfig> {
        let mut sources = Vec::new();

        let global = self.load_global_config().await?.map(|(config, source)| {
            sources.push(source);
            config
        });
        let project = self.load_project_config().await?.map(|(config, source)| {
            sources.push(source);
            config
        });

        for key in env_overrides.keys() {
            if env_field(key).is_some() {
                sources.push(ConfigSource::Environment(key.clone()));
            }
        }
        if !cli_overrides.is_empty() {
            sources.push(ConfigSource::CommandLine);
        }

        let config = ConfigLayering::merge_configs(global, project, env_overrides, cli_overrides)?;
        debug!(sources = ?sources, "Loaded configuration");
        Ok(LoadedConfig { config, sources })
    }
}

impl ConfigLayering {
    /// Merge multiple configuration layers
    pub fn merge_configs(
        global_config: Option<StowToml>,
        project_config: Option<StowToml>,
        env_overrides: &HashMap<String, String>,
        cli_overrides: &HashMap<String, String>,
    ) -> ConfigResult<StowToml> {
        let mut merged = StowToml::default();
        if let Some(global) = global_config {
            merged = merged.merge(global);
        }
        if let Some(project) = project_config {
            merged = merged.merge(project);
        }

        Self::apply_env_overrides(&mut merged, env_overrides)?;
        Self::apply_cli_overrides(&mut merged, cli_overrides)?;

        validate_config(&merged)?;
        Ok(merged)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(config: &mut StowToml, overrides: &HashMap<String, String>) -> ConfigResult<()> {
        for (key, value) in overrides {
            // Unknown STOW_* variables are ignored
            if let Some(field) = env_field(key) {
                set_field(config, field, value).map_err(|e| match e {
                    StowError::Config { message } => StowError::config(format!("{}: {}", key, message)),
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    /// Apply CLI flag overrides, keyed by dotted field name
    fn apply_cli_overrides(config: &mut StowToml, overrides: &HashMap<String, String>) -> ConfigResult<()> {
        for (key, value) in overrides {
            set_field(config, key, value)?;
        }
        Ok(())
    }

    /// Collect environment variable overrides
    pub fn collect_env_overrides() -> HashMap<String, String> {
        std::env::vars().filter(|(key, _)| key.starts_with("STOW_")).collect()
    }
}

fn default_global_path() -> Option<Utf8PathBuf> {
    let dir = Utf8PathBuf::try_from(dirs::config_dir()?).ok()?;
    Some(dir.join("stow").join("config.toml"))
}

/// Dotted field an environment variable sets
fn env_field(key: &str) -> Option<&'static str> {
    let field = match key {
        "STOW_CACHE_DIR" => "cache.path",
        "STOW_CACHE_MAX_SIZE" => "cache.max_size",
        "STOW_CACHE_TTL" => "cache.ttl",
        "STOW_CACHE_MANIFEST_TTL" => "cache.manifest_ttl",
        "STOW_CACHE_POLICY" => "cache.policy",
        "STOW_RETRY_MAX" => "retry.max_retries",
        "STOW_PLAIN_HTTP" => "registry.plain_http",
        "STOW_REGISTRY_TIMEOUT" => "registry.timeout",
        _ => return None,
    };
    Some(field)
}

fn set_field(config: &mut StowToml, field: &str, value: &str) -> ConfigResult<()> {
    match field {
        "cache.path" => config.cache.path = Some(Utf8PathBuf::from(value)),
        "cache.max_size" => config.cache.max_size = Some(ByteSize(parse_size(value)?)),
        "cache.ttl" | "cache.ttl_secs" => config.cache.ttl_secs = Some(parse_duration(value)?.as_secs()),
        "cache.manifest_ttl" | "cache.manifest_ttl_secs" => {
            config.cache.manifest_ttl_secs = Some(parse_duration(value)?.as_secs())
        }
        "cache.policy" => config.cache.policy = Some(value.parse::<CachePolicy>()?),
        "retry.max_retries" => config.retry.max_retries = Some(parse_number(field, value)?),
        "pull.max_files" => config.pull.max_files = Some(parse_number(field, value)?),
        "pull.max_total_size" => config.pull.max_total_size = Some(ByteSize(parse_size(value)?)),
        "pull.max_file_size" => config.pull.max_file_size = Some(ByteSize(parse_size(value)?)),
        "pull.allow_hidden_files" => config.pull.allow_hidden_files = Some(parse_bool(field, value)?),
        "registry.plain_http" => config.registry.plain_http = Some(parse_bool(field, value)?),
        "registry.timeout" | "registry.timeout_secs" => {
            config.registry.timeout_secs = Some(parse_duration(value)?.as_secs())
        }
        other => return Err(StowError::config(format!("unknown setting '{}'", other))),
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StowError::config(format!("{} expects a number, got '{}'", field, value)))
}

fn parse_bool(field: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StowError::config(format!("{} expects true or false, got '{}'", field, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toml::parse_stow_toml;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_config_path_walks_up() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8(&temp_dir);
        tokio::fs::write(root.join(PROJECT_FILE), "[cache]\nttl_secs = 60\n").await.unwrap();
        let nested = root.join("a").join("b");
        tokio::fs::create_dir_all(&nested).await.unwrap();

        let loader = ConfigLoader::new(nested).with_global_path(None);
        assert_eq!(loader.resolve_config_path(PROJECT_FILE), Some(root.join(PROJECT_FILE)));

        let (config, source) = loader.load_project_config().await.unwrap().unwrap();
        assert_eq!(config.cache.ttl_secs, Some(60));
        assert_eq!(source, ConfigSource::Project(root.join(PROJECT_FILE)));
    }

    #[tokio::test]
    async fn test_load_without_files_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new(utf8(&temp_dir)).with_global_path(None);

        let loaded = loader.load(&HashMap::new(), &HashMap::new()).await.unwrap();
        assert_eq!(loaded.config, StowToml::default());
        assert!(loaded.sources.is_empty());
    }

    #[tokio::test]
    async fn test_layers_apply_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8(&temp_dir);
        let global = root.join("global.toml");
        tokio::fs::write(&global, "[cache]\nmax_size = 100\nttl_secs = 10\nmanifest_ttl_secs = 5\n")
            .await
            .unwrap();
        let project = root.join("project");
        tokio::fs::create_dir_all(&project).await.unwrap();
        tokio::fs::write(project.join(PROJECT_FILE), "[cache]\nttl_secs = 20\n").await.unwrap();

        let env = HashMap::from([
            ("STOW_CACHE_MAX_SIZE".to_string(), "1KiB".to_string()),
            ("STOW_UNRELATED".to_string(), "ignored".to_string()),
        ]);
        let cli = HashMap::from([("cache.ttl".to_string(), "1h".to_string())]);

        let loader = ConfigLoader::new(project.clone()).with_global_path(Some(global.clone()));
        let loaded = loader.load(&env, &cli).await.unwrap();

        assert_eq!(loaded.config.cache.manifest_ttl_secs, Some(5));
        assert_eq!(loaded.config.cache.max_size, Some(ByteSize(1024)));
        assert_eq!(loaded.config.cache.ttl_secs, Some(3600));
        assert_eq!(
            loaded.sources,
            vec![
                ConfigSource::Global(global),
                ConfigSource::Project(project.join(PROJECT_FILE)),
                ConfigSource::Environment("STOW_CACHE_MAX_SIZE".to_string()),
                ConfigSource::CommandLine,
            ]
        );
    }

    #[tokio::test]
    async fn test_broken_project_file_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let root = utf8(&temp_dir);
        tokio::fs::write(root.join(PROJECT_FILE), "[cache\n").await.unwrap();

        let loader = ConfigLoader::new(root.clone()).with_global_path(None);
        let err = loader.load(&HashMap::new(), &HashMap::new()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains(root.join(PROJECT_FILE).as_str()), "{}", message);
        assert!(message.contains("line"), "{}", message);
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("STOW_CACHE_DIR".to_string(), "/tmp/stow".to_string()),
            ("STOW_CACHE_POLICY".to_string(), "pull".to_string()),
            ("STOW_CACHE_TTL".to_string(), "2h".to_string()),
            ("STOW_PLAIN_HTTP".to_string(), "yes".to_string()),
            ("STOW_RETRY_MAX".to_string(), "7".to_string()),
        ]);

        let merged = ConfigLayering::merge_configs(None, None, &env, &HashMap::new()).unwrap();
        assert_eq!(merged.cache.path, Some(Utf8PathBuf::from("/tmp/stow")));
        assert_eq!(merged.cache.policy, Some(CachePolicy::Pull));
        assert_eq!(merged.cache.ttl_secs, Some(7200));
        assert_eq!(merged.registry.plain_http, Some(true));
        assert_eq!(merged.retry.max_retries, Some(7));
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let env = HashMap::from([("STOW_PLAIN_HTTP".to_string(), "maybe".to_string())]);
        let err = ConfigLayering::merge_configs(None, None, &env, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("STOW_PLAIN_HTTP"));
    }

    #[test]
    fn test_cli_wins_over_project() {
        let project = parse_stow_toml("[pull]\nmax_files = 10\n").unwrap();
        let cli = HashMap::from([("pull.max_files".to_string(), "20".to_string())]);

        let merged = ConfigLayering::merge_configs(None, Some(project), &HashMap::new(), &cli).unwrap();
        assert_eq!(merged.pull.max_files, Some(20));
    }

    #[test]
    fn test_unknown_cli_setting_is_an_error() {
        let cli = HashMap::from([("cache.colour".to_string(), "blue".to_string())]);
        assert!(ConfigLayering::merge_configs(None, None, &HashMap::new(), &cli).is_err());
    }

    #[test]
    fn test_merged_values_are_validated() {
        let cli = HashMap::from([("cache.max_size".to_string(), "0".to_string())]);
        assert!(ConfigLayering::merge_configs(None, None, &HashMap::new(), &cli).is_err());
    }

    #[test]
    fn test_collect_env_overrides() {
        std::env::set_var("STOW_TEST_COLLECT_MARKER", "1");
        std::env::set_var("NOT_STOW_TEST_COLLECT_MARKER", "1");

        let overrides = ConfigLayering::collect_env_overrides();
        assert!(overrides.contains_key("STOW_TEST_COLLECT_MARKER"));
        assert!(!overrides.contains_key("NOT_STOW_TEST_COLLECT_MARKER"));

        std::env::remove_var("STOW_TEST_COLLECT_MARKER");
        std::env::remove_var("NOT_STOW_TEST_COLLECT_MARKER");
    }
}
