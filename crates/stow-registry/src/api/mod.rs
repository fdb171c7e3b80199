//! OCI manifest and descriptor types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stow_core::error::StowError;
use stow_core::Digest;

use crate::{Descriptor, RegistryResult};

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const EMPTY_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";
pub const BUNDLE_ARTIFACT_TYPE: &str = "application/vnd.stow.bundle.v1";
pub const BUNDLE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation carrying the layer's file name
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Content of the empty config blob
pub const EMPTY_CONFIG: &[u8] = b"{}";

/// Accept header sent with manifest requests
pub fn manifest_accept() -> String {
    format!("{}, {}", OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE)
}

/// Image manifest as served by `/v2/<repo>/manifests/<ref>`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version (always 2)
    pub schema_version: u32,
    /// Manifest media type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Artifact type for non-image artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Config descriptor
    pub config: OciDescriptor,
    /// Layer descriptors
    pub layers: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Content descriptor inside a manifest
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciDescriptor {
    /// Descriptor of the `{}` config blob
    pub fn empty_config() -> Self {
        Self {
            media_type: EMPTY_CONFIG_MEDIA_TYPE.to_string(),
            digest: Digest::of(EMPTY_CONFIG),
            size: EMPTY_CONFIG.len() as u64,
            annotations: None,
        }
    }
}

impl Manifest {
    /// Single-layer manifest wrapping a bundle archive
    pub fn for_bundle(layer: &Descriptor) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(TITLE_ANNOTATION.to_string(), "bundle.tar.gz".to_string());

        Self {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            artifact_type: Some(BUNDLE_ARTIFACT_TYPE.to_string()),
            config: OciDescriptor::empty_config(),
            layers: vec![OciDescriptor {
                media_type: layer.media_type.clone(),
                digest: layer.digest.clone(),
                size: layer.size,
                annotations: Some(annotations),
            }],
            annotations: None,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> RegistryResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StowError::serialization("Failed to parse manifest", e))
    }

    pub fn to_bytes(&self) -> RegistryResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StowError::serialization("Failed to encode manifest", e))
    }

    /// The layer holding the bundle archive
    pub fn bundle_layer(&self) -> Option<&OciDescriptor> {
        self.layers.first()
    }

    /// Get total compressed size of all layers
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_manifest_shape() {
        let layer = Descriptor::new(BUNDLE_LAYER_MEDIA_TYPE, b"archive".to_vec());
        let manifest = Manifest::for_bundle(&layer);
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_bytes().unwrap()).unwrap();

        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["artifactType"], BUNDLE_ARTIFACT_TYPE);
        assert_eq!(json["config"]["mediaType"], EMPTY_CONFIG_MEDIA_TYPE);
        assert_eq!(json["layers"][0]["digest"], layer.digest.to_string());
        assert_eq!(json["layers"][0]["size"], 7);
    }

    #[test]
    fn test_parse_docker_manifest() {
        let body = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": Digest::of(b"config").to_string(),
                "size": 6
            },
            "layers": [
                { "mediaType": BUNDLE_LAYER_MEDIA_TYPE, "digest": Digest::of(b"one").to_string(), "size": 5000 },
                { "mediaType": BUNDLE_LAYER_MEDIA_TYPE, "digest": Digest::of(b"two").to_string(), "size": 3000 }
            ]
        });

        let manifest = Manifest::from_slice(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(manifest.total_layer_size(), 8000);
        assert_eq!(manifest.bundle_layer().unwrap().digest, Digest::of(b"one"));
        assert!(manifest.artifact_type.is_none());
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let body = br#"{"schemaVersion":2,"config":{"mediaType":"x","digest":"sha256:nope","size":1},"layers":[]}"#;
        assert!(Manifest::from_slice(body).is_err());
    }
}
