//! # stow-cli
//!
//! Command-line front end for stow: push a directory to an OCI registry,
//! pull it back into a fresh directory, and manage the local cache.
//!
//! Parses arguments, sets up logging, loads layered configuration and
//! dispatches to the command handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stow_core::StowError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::CommandContext;
use output::errors::ErrorFormatter;

/// Push and pull directory bundles through OCI registries
#[derive(Debug, Parser)]
#[command(name = "stow", version, about = "Push and pull directory bundles through OCI registries")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Cache directory (overrides stow.toml and STOW_CACHE_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Which operations use the cache: disabled, enabled, pull or push
    #[arg(long, global = true, value_name = "POLICY")]
    pub cache_policy: Option<String>,

    /// Talk plain HTTP to the registry
    #[arg(long, global = true)]
    pub plain_http: bool,

    /// Registry bearer token
    #[arg(long, global = true, env = "STOW_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Registry username for basic auth
    #[arg(long, global = true, env = "STOW_USERNAME")]
    pub username: Option<String>,

    /// Registry password for basic auth
    #[arg(long, global = true, env = "STOW_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Archive a directory and push it to a registry
    Push {
        /// Directory to push
        source: PathBuf,
        /// Destination, e.g. registry.example.com/team/app:v1
        reference: String,
        /// Do not refresh the local cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Pull a bundle into a new or empty directory
    Pull {
        /// Bundle to pull, by tag or digest
        reference: String,
        /// Directory to extract into
        target: PathBuf,
        /// Go straight to the registry
        #[arg(long)]
        no_cache: bool,
        /// Maximum number of files to extract
        #[arg(long, value_name = "N")]
        max_files: Option<u64>,
        /// Maximum total extracted size, e.g. 512MiB
        #[arg(long, value_name = "SIZE")]
        max_size: Option<String>,
        /// Only extract entries under this archive path
        #[arg(long, value_name = "PATH")]
        strip_prefix: Option<PathBuf>,
    },
    /// Inspect or clean the local cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum CacheAction {
    /// Show how much space the cache uses
    Size,
    /// Remove every cached entry
    Clear,
    /// Remove expired entries now
    Prune,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    debug!("Starting stow v{}", env!("CARGO_PKG_VERSION"));

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;

    rt.block_on(async {
        let ctx = CommandContext::load(&cli).await?;

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        commands::dispatch_command(cli.command, &ctx).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,stow_cli={level},stow_client={level},stow_cache={level},stow_registry={level},stow_config={level}",
            level = level
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(err: &anyhow::Error) {
    let formatter = ErrorFormatter::new();
    match err.downcast_ref::<StowError>() {
        Some(stow_error) => eprintln!("{}", formatter.format_error(stow_error)),
        None => eprintln!("{}", formatter.format_simple(&format!("{:#}", err))),
    }
}
