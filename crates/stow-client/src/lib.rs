//! # stow-client
//!
//! Push directory bundles to an OCI registry and pull them back into
//! local directories, optionally through the crash-safe cache from
//! `stow-cache`.
//!
//! ```no_run
//! # async fn run() -> stow_client::ClientResult<()> {
//! use stow_client::{CacheConfig, CancellationToken, Client, PullOptions};
//!
//! let client = Client::builder()
//!     .with_cache(CacheConfig::at("/var/cache/stow"))
//!     .build()?;
//! let cancel = CancellationToken::new();
//! let report = client
//!     .pull_with_cache(&cancel, "registry.example.com/tools/lint:v3", "./lint", PullOptions::default())
//!     .await?;
//! println!("{} ({} files)", report.digest, report.files);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod client;
pub mod options;

// Re-export main types
pub use archive::{create_archive, extract_archive, ExtractStats};
pub use client::{Client, ClientBuilder, PullReport};
pub use options::{CacheConfig, ExtractLimits, PullOptions, PushOptions};

pub use stow_cache::{Cache, CacheKey, CacheOptions, DiskCache, Entry, MemoryCache};
pub use stow_core::{CachePolicy, Digest, Filesystem, OsFs, Phase, Reference, StowError};
pub use stow_registry::{AuthConfig, Registry, RetryConfig};
pub use tokio_util::sync::CancellationToken;

/// Result type for client operations
pub type ClientResult<T> = Result<T, StowError>;
