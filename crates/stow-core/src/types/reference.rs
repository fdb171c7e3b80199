//! OCI artifact references.
//!
//! A reference names an artifact either by a mutable tag
//! (`registry/repo:tag`) or by an immutable digest
//! (`registry/repo@sha256:<hex>`).

use std::fmt;
use std::str::FromStr;

use super::digest::Digest;
use crate::error::StowError;

/// Tag used when a reference names neither a tag nor a digest
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// A parsed registry reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Digest-pinned references never need tag resolution
    pub fn is_digest_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// The path segment used for `/v2/<repo>/manifests/<segment>`
    pub fn manifest_segment(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Same repository, pinned to a digest
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl FromStr for Reference {
    type Err = StowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StowError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<Digest>()?)),
            None => (s, None),
        };

        let (registry, remainder) = name
            .split_once('/')
            .ok_or_else(|| invalid("reference must include a registry host"))?;
        if !is_registry_host(registry) {
            return Err(invalid("first path component must be a registry host"));
        }

        // A ':' after the last '/' separates the tag; earlier ones belong to the host
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(&remainder[split + 1..]))
            }
            None => (remainder, None),
        };

        if !is_valid_repository(repository) {
            return Err(invalid(
                "repository must be lowercase alphanumerics separated by '/', '.', '_' or '-'",
            ));
        }

        let tag = match tag {
            Some(tag) if !is_valid_tag(tag) => return Err(invalid("tag is not valid")),
            Some(tag) => Some(tag.to_string()),
            None if digest.is_none() => Some(DEFAULT_TAG.to_string()),
            None => None,
        };

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn is_registry_host(host: &str) -> bool {
    !host.is_empty() && (host.contains('.') || host.contains(':') || host == "localhost")
}

fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
                && component.starts_with(|c: char| c.is_ascii_alphanumeric())
        })
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
