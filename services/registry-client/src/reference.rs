//! Image references in the form used by the Docker / OCI ecosystem.

use std::fmt;
use std::str::FromStr;

/// Registry used when a reference names no registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The API endpoint which actually serves [`DEFAULT_REGISTRY`].
const DEFAULT_REGISTRY_ENDPOINT: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";

/// A reference could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference {reference:?}: {reason}")]
pub struct ReferenceError {
    /// The reference as it was given
    pub reference: String,

    /// What was wrong with it
    pub reason: &'static str,
}

impl ReferenceError {
    fn new(reference: &str, reason: &'static str) -> Self {
        Self {
            reference: reference.to_owned(),
            reason,
        }
    }
}

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
///
/// Names without a registry resolve to Docker Hub, and single-component
/// Docker Hub names gain the `library/` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(ReferenceError::new(raw, "empty reference"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                let (algorithm, hex) = digest
                    .split_once(':')
                    .ok_or_else(|| ReferenceError::new(raw, "digest is missing an algorithm"))?;
                if algorithm.is_empty() || hex.is_empty() {
                    return Err(ReferenceError::new(raw, "malformed digest"));
                }
                (name, Some(digest.to_owned()))
            }
            None => (input, None),
        };

        // A tag colon always follows the last slash, otherwise it is a port.
        let last_slash = name.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name.rfind(':') {
            Some(colon) if colon >= last_slash => {
                let tag = &name[colon + 1..];
                if !valid_tag(tag) {
                    return Err(ReferenceError::new(raw, "invalid tag"));
                }
                (&name[..colon], Some(tag.to_owned()))
            }
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), rest.to_owned())
            }
            _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
        };

        if repository.is_empty() {
            return Err(ReferenceError::new(raw, "missing repository"));
        }
        if !repository.split('/').all(valid_path_component) {
            return Err(ReferenceError::new(raw, "invalid repository name"));
        }

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry host (and optional port), as written.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The host actually contacted for API requests.
    pub fn endpoint(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_ENDPOINT
        } else {
            &self.registry
        }
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if one was given.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The manifest reference to request: the digest when pinned, else the tag.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// The URI scheme for this registry.
    ///
    /// Loopback registries are spoken to over plain HTTP, everything else over HTTPS.
    pub fn scheme(&self) -> &'static str {
        let host = match self.registry.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => self.registry.as_str(),
        };
        match host {
            "localhost" | "127.0.0.1" | "[::1]" => "http",
            _ => "https",
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}
