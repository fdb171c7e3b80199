//! The stow client: push directories to a registry and pull them back,
//! optionally through the local cache
//!
//! Settings that can change after construction (policy, default bypass
//! flags, credentials) live behind a read-write lock. Every call copies
//! them once at the start and never holds the lock across an `.await`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use stow_cache::{Cache, CacheKey, DiskCache, Entry, Lookup, TagResolver};
use stow_core::error::{Phase, StowError};
use stow_core::{CachePolicy, Digest, Filesystem, OsFs, Reference};
use stow_registry::{
    retry, Artifact, AuthConfig, Descriptor, HttpRegistry, Manifest, Registry, RetryConfig,
    BUNDLE_LAYER_MEDIA_TYPE,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::archive::{create_archive, ensure_clean_target, materialize, ExtractStats};
use crate::options::{CacheConfig, ExtractLimits, PullOptions, PushOptions};
use crate::ClientResult;


/// Outcome of a successful pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    /// Manifest digest the reference resolved to
    pub digest: Digest,
    /// Served from the local cache without downloading the bundle
    pub from_cache: bool,
    /// Files and symlinks written
    pub files: u64,
    /// Bytes of file content written
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct ClientSettings {
    policy: CachePolicy,
    pull_bypass: bool,
    push_bypass: bool,
    auth: Option<AuthConfig>,
    retry: RetryConfig,
    limits: ExtractLimits,
}

/// Builder for [`Client`]
#[derive(Default)]
pub struct ClientBuilder {
    registry: Option<Arc<dyn Registry>>,
    fs: Option<Arc<dyn Filesystem>>,
    cache: Option<CacheConfig>,
    policy: Option<CachePolicy>,
    pull_bypass: bool,
    push_bypass: bool,
    auth: Option<AuthConfig>,
    retry: RetryConfig,
    limits: ExtractLimits,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a cache; the policy becomes [`CachePolicy::Enabled`] unless
    /// set explicitly
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Default bypass for pulls; per-call options override it
    pub fn pull_cache_bypass(mut self, bypass: bool) -> Self {
        self.pull_bypass = bypass;
        self
    }

    /// Default bypass for push-side cache refreshes
    pub fn push_cache_bypass(mut self, bypass: bool) -> Self {
        self.push_bypass = bypass;
        self
    }

    /// Same as [`pull_cache_bypass`](Self::pull_cache_bypass)
    pub fn cache_bypass(self, bypass: bool) -> Self {
        self.pull_cache_bypass(bypass)
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Default extraction limits for pulls
    pub fn limits(mut self, limits: ExtractLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the client, opening the on-disk cache if one is configured
    pub fn build(self) -> ClientResult<Client> {
        let registry: Arc<dyn Registry> = match self.registry {
            Some(registry) => registry,
            None => Arc::new(HttpRegistry::new()?),
        };
        let fs: Arc<dyn Filesystem> = self.fs.unwrap_or_else(|| Arc::new(OsFs));

        let cache = match &self.cache {
            Some(config) => Some(open_cache(config)?),
            None => None,
        };
        let resolver = cache
            .as_ref()
            .map(|cache| TagResolver::new(cache.clone(), registry.clone()));

        let policy = match (self.policy, &cache) {
            (Some(policy), _) => policy,
            (None, Some(_)) => CachePolicy::Enabled,
            (None, None) => CachePolicy::Disabled,
        };

        Ok(Client {
            registry,
            fs,
            cache,
            resolver,
            settings: RwLock::new(ClientSettings {
                policy,
                pull_bypass: self.pull_bypass,
                push_bypass: self.push_bypass,
                auth: self.auth,
                retry: self.retry,
                limits: self.limits,
            }),
        })
    }
}

fn open_cache(config: &CacheConfig) -> ClientResult<Arc<dyn Cache>> {
    if let Some(coordinator) = &config.coordinator {
        return Ok(coordinator.clone());
    }
    match &config.cache_path {
        Some(path) => Ok(Arc::new(DiskCache::open(path.clone(), config.options())?)),
        None => Err(StowError::invalid_argument(
            "cache",
            "a cache needs either a coordinator or a cache path",
        )),
    }
}

/// Pushes and pulls directory bundles
pub struct Client {
    registry: Arc<dyn Registry>,
    fs: Arc<dyn Filesystem>,
    cache: Option<Arc<dyn Cache>>,
    resolver: Option<TagResolver>,
    settings: RwLock<ClientSettings>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cache", &self.cache)
            .field("settings", &*self.settings.read())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn set_cache_policy(&self, policy: CachePolicy) {
        self.settings.write().policy = policy;
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.settings.read().policy
    }

    pub fn set_auth(&self, auth: Option<AuthConfig>) {
        self.settings.write().auth = auth;
    }

    /// The cache coordinator, if one is configured
    pub fn cache(&self) -> Option<Arc<dyn Cache>> {
        self.cache.clone()
    }

    fn snapshot(&self) -> ClientSettings {
        self.settings.read().clone()
    }

    /// Pull `reference` into `target` straight from the registry
    #[instrument(skip(self, cancel, target, options), fields(dir = %target.as_ref().display()))]
    pub async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        target: impl AsRef<Path>,
        options: PullOptions,
    ) -> ClientResult<PullReport> {
        let (reference, target) = self.check_pull_args(reference, target.as_ref())?;
        let settings = self.snapshot();
        let call = PullCall::new(&settings, options);
        self.fetch_and_materialize(cancel, &reference, &target, &call)
            .await
            .map(|(report, _)| report)
    }

    /// Pull through the cache when pull caching is active, otherwise
    /// behave exactly like [`pull`](Self::pull)
    ///
    /// Concurrent pulls of one reference are serialized on the cache key,
    /// so at most one of them talks to the registry.
    #[instrument(skip(self, cancel, target, options), fields(dir = %target.as_ref().display()))]
    pub async fn pull_with_cache(
        &self,
        cancel: &CancellationToken,
        reference: &str,
        target: impl AsRef<Path>,
        options: PullOptions,
    ) -> ClientResult<PullReport> {
        let (reference, target) = self.check_pull_args(reference, target.as_ref())?;
        let settings = self.snapshot();
        let bypass = options.cache_bypass.unwrap_or(settings.pull_bypass);
        let call = PullCall::new(&settings, options);

        let (cache, resolver) = match (&self.cache, &self.resolver) {
            (Some(cache), Some(resolver)) if settings.policy.caches_pull() && !bypass => (cache, resolver),
            _ => {
                debug!(policy = %settings.policy, bypass, "Pull caching inactive");
                return self
                    .fetch_and_materialize(cancel, &reference, &target, &call)
                    .await
                    .map(|(report, _)| report);
            }
        };

        let key = CacheKey::pull(&reference);
        let _guard = cache.lock(&key, cancel).await.map_err(|e| match e {
            StowError::Cancelled => e,
            e => e.in_phase(reference.to_string(), Phase::Cache),
        })?;

        match resolver
            .lookup(cancel, &reference, &key, &call.retry, call.auth.as_ref())
            .await
        {
            Ok(Lookup::Hit(entry)) => {
                let stats = self
                    .unpack(entry.data().clone(), &target, &call.limits)
                    .await
                    .map_err(|e| e.in_phase(reference.to_string(), Phase::Extract))?;
                info!(reference = %reference, digest = %entry.resolved_digest, files = stats.files, "Pulled from cache");
                return Ok(PullReport {
                    digest: entry.resolved_digest,
                    from_cache: true,
                    files: stats.files,
                    bytes: stats.bytes,
                });
            }
            Ok(Lookup::Miss) => {}
            Err(StowError::Cancelled) => return Err(StowError::Cancelled),
            Err(e) => {
                warn!(reference = %reference, error = %e, "Cache lookup failed; pulling from registry");
            }
        }

        let (report, artifact) = self.fetch_and_materialize(cancel, &reference, &target, &call).await?;
        let entry = Entry::new(
            artifact.manifest_digest,
            artifact.descriptor.media_type.clone(),
            artifact.manifest,
            artifact.descriptor.into_bytes(),
        );
        if let Err(e) = cache.put(&key, entry).await {
            warn!(key = %key, error = %e, "Failed to cache pulled bundle");
        }
        Ok(report)
    }

    /// Archive `source_dir` and push it as `reference`; returns the
    /// manifest digest
    #[instrument(skip(self, cancel, source_dir, options), fields(source = %source_dir.as_ref().display()))]
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        source_dir: impl AsRef<Path>,
        reference: &str,
        options: PushOptions,
    ) -> ClientResult<Digest> {
        let source_dir = source_dir.as_ref();
        if source_dir.as_os_str().is_empty() {
            return Err(StowError::invalid_argument("source_dir", "must not be empty"));
        }
        let reference = parse_reference(reference)?;
        if reference.is_digest_pinned() {
            return Err(StowError::invalid_argument(
                "reference",
                "push needs a tag, not a digest",
            ));
        }

        let settings = self.snapshot();
        let retry_config = options.retry.unwrap_or_else(|| settings.retry.clone());
        let bypass = options.cache_bypass.unwrap_or(settings.push_bypass);

        let source = source_dir.to_path_buf();
        let payload = tokio::task::spawn_blocking(move || create_archive(&source))
            .await
            .map_err(join_error)
            .and_then(|result| result)
            .map_err(|e| e.in_phase(reference.to_string(), Phase::Archive))?;

        let descriptor = Descriptor::new(BUNDLE_LAYER_MEDIA_TYPE, payload);
        debug!(reference = %reference, digest = %descriptor.digest, size = descriptor.size, "Archived bundle");

        let manifest_digest = retry(cancel, &retry_config, || {
            self.registry.push(&reference, &descriptor, settings.auth.as_ref())
        })
        .await
        .map_err(|e| e.in_phase(reference.to_string(), Phase::Upload))?;
        info!(reference = %reference, digest = %manifest_digest, size = descriptor.size, "Pushed bundle");

        match &self.cache {
            Some(cache) if settings.policy.caches_push() && !bypass => {
                self.refresh_cache(cancel, cache.as_ref(), &reference, &manifest_digest, descriptor)
                    .await;
            }
            _ => {}
        }
        Ok(manifest_digest)
    }

    /// Replace the pull entry for a just-pushed reference, or drop it if
    /// that fails so a stale bundle is never served
    async fn refresh_cache(
        &self,
        cancel: &CancellationToken,
        cache: &dyn Cache,
        reference: &Reference,
        manifest_digest: &Digest,
        descriptor: Descriptor,
    ) {
        let key = CacheKey::pull(reference);
        let _guard = match cache.lock(&key, cancel).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not lock cache entry after push");
                return;
            }
        };

        let stored = match Manifest::for_bundle(&descriptor).to_bytes() {
            Ok(manifest) => {
                let entry = Entry::new(
                    manifest_digest.clone(),
                    descriptor.media_type.clone(),
                    manifest,
                    descriptor.into_bytes(),
                );
                cache.put(&key, entry).await
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(()) => debug!(key = %key, "Refreshed cache after push"),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to refresh cache after push; dropping entry");
                if let Err(e) = cache.delete(&key).await {
                    warn!(key = %key, error = %e, "Failed to drop stale cache entry");
                }
            }
        }
    }

    fn check_pull_args(&self, reference: &str, target: &Path) -> ClientResult<(Reference, PathBuf)> {
        if target.as_os_str().is_empty() {
            return Err(StowError::invalid_argument("target_dir", "must not be empty"));
        }
        let reference = parse_reference(reference)?;
        ensure_clean_target(self.fs.as_ref(), target)?;
        Ok((reference, target.to_path_buf()))
    }

    async fn fetch_and_materialize(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        target: &Path,
        call: &PullCall,
    ) -> ClientResult<(PullReport, Artifact)> {
        let artifact = retry(cancel, &call.retry, || self.registry.pull(reference, call.auth.as_ref()))
            .await
            .map_err(|e| e.in_phase(reference.to_string(), Phase::Download))?;
        debug!(
            reference = %reference,
            digest = %artifact.manifest_digest,
            size = artifact.descriptor.size,
            "Downloaded bundle"
        );

        let stats = self
            .unpack(artifact.descriptor.bytes().clone(), target, &call.limits)
            .await
            .map_err(|e| e.in_phase(reference.to_string(), Phase::Extract))?;
        info!(reference = %reference, digest = %artifact.manifest_digest, files = stats.files, "Pulled from registry");

        let report = PullReport {
            digest: artifact.manifest_digest.clone(),
            from_cache: false,
            files: stats.files,
            bytes: stats.bytes,
        };
        Ok((report, artifact))
    }

    /// Extract on the blocking pool
    async fn unpack(&self, data: Bytes, target: &Path, limits: &ExtractLimits) -> ClientResult<ExtractStats> {
        let fs = self.fs.clone();
        let target = target.to_path_buf();
        let limits = limits.clone();
        tokio::task::spawn_blocking(move || materialize(fs.as_ref(), &data, &target, &limits))
            .await
            .map_err(join_error)?
    }
}

/// Per-call pull settings after applying overrides
struct PullCall {
    retry: RetryConfig,
    limits: ExtractLimits,
    auth: Option<AuthConfig>,
}

impl PullCall {
    fn new(settings: &ClientSettings, options: PullOptions) -> Self {
        Self {
            retry: options.retry.unwrap_or_else(|| settings.retry.clone()),
            limits: options.limits.unwrap_or_else(|| settings.limits.clone()),
            auth: settings.auth.clone(),
        }
    }
}

fn parse_reference(reference: &str) -> ClientResult<Reference> {
    if reference.trim().is_empty() {
        return Err(StowError::invalid_argument("reference", "must not be empty"));
    }
    reference.parse()
}

fn join_error(e: tokio::task::JoinError) -> StowError {
    StowError::io("Background task failed", io::Error::new(io::ErrorKind::Other, e))
}
