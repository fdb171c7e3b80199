//! HTTP registry speaking the OCI distribution API
//!
//! Push uploads the empty config blob and the bundle layer (skipping blobs
//! the registry already has), then tags a single-layer manifest. Pull
//! fetches the manifest and its first layer, verifying both digests.
//! Retrying is the caller's business; every method here makes one attempt.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use stow_core::error::StowError;
use stow_core::{Digest, Reference};
use tracing::{debug, info};
use url::Url;

use crate::api::{manifest_accept, Manifest, OciDescriptor, EMPTY_CONFIG, OCI_MANIFEST_MEDIA_TYPE};
use crate::{Artifact, AuthConfig, Descriptor, Registry, RegistryResult};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Connection settings for [`HttpRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS (local registries, tests)
    pub plain_http: bool,
    /// Per-request timeout
    pub timeout: Duration,
    pub user_agent: String,
    /// Largest layer a pull will download
    pub max_blob_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plain_http: false,
            timeout: Duration::from_secs(30),
            user_agent: format!("stow/{}", env!("CARGO_PKG_VERSION")),
            max_blob_size: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// [`Registry`] backed by reqwest with connection pooling
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: Client,
    config: RegistryConfig,
}

impl HttpRegistry {
    pub fn new() -> RegistryResult<Self> {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> RegistryResult<Self> {
        let client = ClientBuilder::new()
            // Connection pooling configuration
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .gzip(true)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| StowError::network(format!("Failed to create HTTP client: {}", e), e))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn repository_url(&self, reference: &Reference) -> String {
        let scheme = if self.config.plain_http { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, reference.registry(), reference.repository())
    }

    fn manifest_url(&self, reference: &Reference) -> String {
        format!("{}/manifests/{}", self.repository_url(reference), reference.manifest_segment())
    }

    fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.repository_url(reference), digest)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> RegistryResult<Response> {
        request.send().await.map_err(|e| transport_error(e, what))
    }

    async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<bool> {
        let request = authorize(self.client.head(self.blob_url(reference, digest)), auth)?;
        let response = self.send(request, "check blob").await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => ensure_success(response, reference).await.map(|_| false),
        }
    }

    /// Monolithic upload: open a session, then PUT the whole blob to it
    async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        content: Bytes,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<()> {
        if self.blob_exists(reference, digest, auth).await? {
            debug!(digest = %digest, "Blob already present, skipping upload");
            return Ok(());
        }

        let start_url = format!("{}/blobs/uploads/", self.repository_url(reference));
        let request = authorize(self.client.post(&start_url), auth)?;
        let response = ensure_success(self.send(request, "start upload").await?, reference).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StowError::RegistryStatus {
                status: response.status().as_u16(),
                message: "upload session has no Location header".to_string(),
            })?;

        let mut upload_url = Url::parse(&start_url)
            .and_then(|base| base.join(location))
            .map_err(|e| StowError::network(format!("Invalid upload location '{}'", location), e))?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let size = content.len();
        let request = self
            .client
            .put(upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content);
        let request = authorize(request, auth)?;
        ensure_success(self.send(request, "upload blob").await?, reference).await?;

        debug!(digest = %digest, size, "Blob uploaded");
        Ok(())
    }

    async fn fetch_manifest(
        &self,
        reference: &Reference,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<(Digest, Bytes)> {
        let url = self.manifest_url(reference);
        debug!(url = %url, "Pulling manifest");

        let request = authorize(self.client.get(&url).header("Accept", manifest_accept()), auth)?;
        let response = ensure_success(self.send(request, "fetch manifest").await?, reference).await?;
        let advertised = content_digest(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, "read manifest"))?;

        let computed = Digest::of(&body);
        if let Some(pinned) = reference.digest() {
            if *pinned != computed {
                return Err(StowError::IntegrityFailure {
                    subject: format!("manifest of {}", reference),
                    expected: pinned.to_string(),
                    actual: computed.to_string(),
                });
            }
        } else if let Some(advertised) = advertised {
            if advertised != computed {
                debug!(advertised = %advertised, computed = %computed, "Registry digest header disagrees with body");
            }
        }

        Ok((computed, body))
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        layer: &OciDescriptor,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<Bytes> {
        let max = self.config.max_blob_size;
        if layer.size > max {
            return Err(StowError::LimitExceeded {
                limit: "layer size".to_string(),
                actual: layer.size,
                max,
            });
        }

        let url = self.blob_url(reference, &layer.digest);
        debug!(url = %url, "Pulling blob");

        let request = authorize(self.client.get(&url), auth)?;
        let response = ensure_success(self.send(request, "fetch blob").await?, reference).await?;

        if let Some(size) = response.content_length() {
            if size > max {
                return Err(StowError::LimitExceeded {
                    limit: "layer size".to_string(),
                    actual: size,
                    max,
                });
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, "read blob"))?;

        let computed = Digest::of(&bytes);
        if computed != layer.digest {
            return Err(StowError::IntegrityFailure {
                subject: format!("layer of {}", reference),
                expected: layer.digest.to_string(),
                actual: computed.to_string(),
            });
        }

        Ok(bytes)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn push(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        auth: Option<&AuthConfig>,
    ) -> RegistryResult<Digest> {
        let config = OciDescriptor::empty_config();
        self.upload_blob(reference, &config.digest, Bytes::from_static(EMPTY_CONFIG), auth)
            .await?;
        self.upload_blob(reference, &descriptor.digest, descriptor.bytes().clone(), auth)
            .await?;

        let manifest = Manifest::for_bundle(descriptor).to_bytes()?;
        let digest = Digest::of(&manifest);

        let request = self
            .client
            .put(self.manifest_url(reference))
            .header(CONTENT_TYPE, OCI_MANIFEST_MEDIA_TYPE)
            .body(manifest);
        let request = authorize(request, auth)?;
        ensure_success(self.send(request, "put manifest").await?, reference).await?;

        info!(reference = %reference, digest = %digest, size = descriptor.size, "Pushed bundle");
        Ok(digest)
    }

    async fn pull(&self, reference: &Reference, auth: Option<&AuthConfig>) -> RegistryResult<Artifact> {
        let (manifest_digest, manifest_bytes) = self.fetch_manifest(reference, auth).await?;
        let manifest = Manifest::from_slice(&manifest_bytes)?;
        let layer = manifest.bundle_layer().ok_or_else(|| StowError::Serialization {
            message: format!("manifest for {} has no layers", reference),
            source: None,
        })?;

        let content = self.fetch_blob(reference, layer, auth).await?;
        info!(
            reference = %reference,
            digest = %manifest_digest,
            size = content.len(),
            "Pulled bundle"
        );

        Ok(Artifact {
            manifest_digest,
            manifest: manifest_bytes,
            descriptor: Descriptor::new(layer.media_type.clone(), content),
        })
    }

    async fn resolve(&self, reference: &Reference, auth: Option<&AuthConfig>) -> RegistryResult<Digest> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.clone());
        }

        let request = authorize(
            self.client
                .head(self.manifest_url(reference))
                .header("Accept", manifest_accept()),
            auth,
        )?;
        let response = ensure_success(self.send(request, "resolve tag").await?, reference).await?;
        if let Some(digest) = content_digest(response.headers()) {
            return Ok(digest);
        }

        // Some registries omit the digest header on HEAD
        debug!(reference = %reference, "No digest header on HEAD, hashing manifest");
        let (digest, _) = self.fetch_manifest(reference, auth).await?;
        Ok(digest)
    }
}

/// Attach credentials to a request; a token wins over basic auth
fn authorize(request: RequestBuilder, auth: Option<&AuthConfig>) -> RegistryResult<RequestBuilder> {
    let Some(auth) = auth else {
        return Ok(request);
    };

    let value = if let Some(token) = &auth.token {
        format!("Bearer {}", token)
    } else if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", username, password))
        )
    } else {
        return Ok(request);
    };

    let value: reqwest::header::HeaderValue = value
        .parse()
        .map_err(|e| StowError::invalid_argument("auth", format!("Invalid credentials: {}", e)))?;
    Ok(request.header(AUTHORIZATION, value))
}

fn content_digest(headers: &HeaderMap) -> Option<Digest> {
    headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn transport_error(error: reqwest::Error, what: &str) -> StowError {
    if error.is_timeout() {
        StowError::Timeout {
            message: format!("{}: {}", what, error),
        }
    } else {
        StowError::network(format!("Failed to {}: {}", what, error), error)
    }
}

/// Map non-2xx responses onto the error taxonomy
async fn ensure_success(response: Response, reference: &Reference) -> RegistryResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => Err(StowError::NotFound {
            reference: reference.to_string(),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StowError::Unauthorized {
            reference: reference.to_string(),
        }),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("unexpected status").to_string()
            } else {
                body.chars().take(200).collect()
            };
            Err(StowError::RegistryStatus {
                status: status.as_u16(),
                message,
            })
        }
    }
}
