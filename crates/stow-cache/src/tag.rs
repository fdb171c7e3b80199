//! Deciding whether a cached entry still answers a reference
//!
//! Digest-pinned references are checked locally. Tags are trusted until
//! their manifest record passes its short TTL; after that the registry
//! must confirm the tag still points at the cached digest.

use std::sync::Arc;

use stow_core::Reference;
use stow_registry::{retry, AuthConfig, Registry, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::Cache;
use crate::entry::{CacheKey, Entry};
use crate::CacheResult;

/// Outcome of a cache lookup
#[derive(Debug)]
pub enum Lookup {
    Hit(Entry),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

#[derive(Clone)]
pub struct TagResolver {
    cache: Arc<dyn Cache>,
    registry: Arc<dyn Registry>,
}

impl std::fmt::Debug for TagResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagResolver").field("cache", &self.cache).finish_non_exhaustive()
    }
}

impl TagResolver {
    pub fn new(cache: Arc<dyn Cache>, registry: Arc<dyn Registry>) -> Self {
        Self { cache, registry }
    }

    /// Look `key` up for `reference`, revalidating stale tags
    ///
    /// A tag found to have moved is deleted from the cache before
    /// returning [`Lookup::Miss`]. Errors other than cache misses, and
    /// registry failures during revalidation, propagate.
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        reference: &Reference,
        key: &CacheKey,
        retry_config: &RetryConfig,
        auth: Option<&AuthConfig>,
    ) -> CacheResult<Lookup> {
        let entry = match self.cache.get(key).await {
            Ok(entry) => entry,
            Err(e) if e.is_cache_miss() => {
                debug!(key = %key, reason = %e, "Cache lookup missed");
                return Ok(Lookup::Miss);
            }
            Err(e) => return Err(e),
        };

        if let Some(pinned) = reference.digest() {
            if entry.resolved_digest == *pinned {
                return Ok(Lookup::Hit(entry));
            }
            debug!(key = %key, cached = %entry.resolved_digest, pinned = %pinned, "Cached digest does not match pin");
            self.cache.delete(key).await?;
            return Ok(Lookup::Miss);
        }

        if !entry.needs_revalidation {
            return Ok(Lookup::Hit(entry));
        }

        let current = retry(cancel, retry_config, || self.registry.resolve(reference, auth)).await?;
        if current == entry.resolved_digest {
            self.cache.revalidate(key).await?;
            debug!(key = %key, digest = %current, "Tag revalidated");
            Ok(Lookup::Hit(entry))
        } else {
            info!(
                reference = %reference,
                cached = %entry.resolved_digest,
                current = %current,
                "Tag moved; discarding cached entry"
            );
            self.cache.delete(key).await?;
            Ok(Lookup::Miss)
        }
    }
}
