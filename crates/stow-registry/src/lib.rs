//! OCI registry client for stow
//!
//! This crate defines the [`Registry`] collaborator the client and cache
//! talk to, an HTTP implementation speaking the OCI distribution API, and
//! the bounded exponential-backoff [`retry`] executor wrapped around every
//! network call.

pub mod api;
pub mod client;
pub mod retry;

use std::fmt;
use std::io::{Cursor, Read};

use async_trait::async_trait;
use bytes::Bytes;
use stow_core::error::StowError;
use stow_core::{Digest, Reference};

// Re-export main types
pub use api::{Manifest, OciDescriptor, BUNDLE_LAYER_MEDIA_TYPE};
pub use client::{HttpRegistry, RegistryConfig};
pub use retry::{retry, RetryConfig};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, StowError>;

/// Credentials forwarded to the registry on every request
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// Bearer token for authentication
    pub token: Option<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthConfig")
            .field("token", &redact(&self.token))
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .finish()
    }
}

/// A blob plus the metadata needed to upload or describe it
///
/// The payload is reference-counted, so cloning a descriptor or opening
/// a new [`reader`](Descriptor::reader) always starts from the first byte.
/// Retried uploads rely on this.
#[derive(Clone)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    payload: Bytes,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            media_type: media_type.into(),
            digest: Digest::of(&payload),
            size: payload.len() as u64,
            payload,
        }
    }

    /// A fresh reader positioned at the start of the payload
    pub fn reader(&self) -> impl Read + Send + 'static {
        Cursor::new(self.payload.clone())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("media_type", &self.media_type)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}

/// Result of pulling a reference: its manifest and the bundle layer
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Digest of the manifest the reference resolved to
    pub manifest_digest: Digest,
    /// Raw manifest bytes
    pub manifest: Bytes,
    /// The bundle layer
    pub descriptor: Descriptor,
}

/// Registry collaborator used by the client and the tag resolver
#[async_trait]
pub trait Registry: Send + Sync {
    /// Upload a bundle layer and tag it; returns the manifest digest
    async fn push(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<Digest>;

    /// Fetch the manifest and bundle layer a reference points at
    async fn pull(&self, reference: &Reference, auth: Option<&AuthConfig>) -> RegistryResult<Artifact>;

    /// Resolve a reference to its current manifest digest
    async fn resolve(&self, reference: &Reference, auth: Option<&AuthConfig>) -> RegistryResult<Digest>;
}
