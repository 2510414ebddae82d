//! The image backend: where manifests and blobs come from.
//!
//! An [`ImageSource`] knows how to fetch raw documents and blob streams from
//! one place (a registry, an OCI layout directory, memory). The
//! [`ImageBackend`] sits on top of a source, opens it lazily exactly once, and
//! turns raw manifests into the normalised [`ManifestResult`].

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use registry_client::{Credentials, ImageReference};
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;

use crate::digest::{Algorithm, Digest};
use crate::error::{ProxyError, ProxyResult};
use crate::manifest::{self, ImageIndex, ImageManifest, ManifestResult, Platform};

mod docker;
mod layout;
mod memory;

pub use self::docker::DockerSource;
pub use self::layout::LayoutSource;
pub use self::memory::MemorySource;

/// A readable blob stream.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// A manifest document exactly as the source holds it.
#[derive(Debug, Clone)]
pub struct RawManifest {
    /// The document
    pub bytes: Bytes,
    /// Media type declared by the source, if any
    pub media_type: Option<String>,
}

/// An open blob.
pub struct Blob {
    /// The blob's content
    pub reader: BlobReader,
    /// The blob's size, when the source knows it
    pub size: Option<u64>,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("size", &self.size).finish()
    }
}

/// A place images can be read from.
#[async_trait::async_trait]
pub trait ImageSource: fmt::Debug + Send + Sync + 'static {
    /// Check the source is usable. Called once, before any fetch.
    async fn connect(&self) -> ProxyResult<()> {
        Ok(())
    }

    /// Fetch the top level manifest, or the manifest with digest `instance`.
    async fn fetch_manifest(&self, instance: Option<&Digest>) -> ProxyResult<RawManifest>;

    /// Open a blob for reading.
    async fn fetch_blob(&self, digest: &Digest) -> ProxyResult<Blob>;
}

/// An image name, with the transport it is reached by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageName {
    /// `docker://<reference>`: an image in a registry
    Docker(ImageReference),
    /// `oci:<dir>[:<tag>]`: an image in a local OCI layout
    Layout {
        /// The layout directory
        path: Utf8PathBuf,
        /// The `org.opencontainers.image.ref.name` to pick
        tag: Option<String>,
    },
}

impl ImageName {
    /// Open a source for this image. Nothing is contacted yet.
    pub fn open(&self, credentials: Option<Credentials>) -> Arc<dyn ImageSource> {
        match self {
            ImageName::Docker(reference) => {
                let mut client = registry_client::RegistryClient::new(reference.clone());
                if let Some(credentials) = credentials {
                    client = client.with_credentials(credentials);
                }
                Arc::new(DockerSource::new(client))
            }
            ImageName::Layout { path, tag } => {
                Arc::new(LayoutSource::new(path.clone(), tag.clone()))
            }
        }
    }
}

impl FromStr for ImageName {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ProxyError::ReferenceParse {
            reference: s.to_owned(),
            reason: reason.to_owned(),
        };

        let (transport, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing transport, e.g. docker://"))?;

        match transport {
            "docker" => {
                let reference = rest
                    .strip_prefix("//")
                    .ok_or_else(|| invalid("expected docker://<reference>"))?;
                Ok(ImageName::Docker(ImageReference::parse(reference)?))
            }
            "oci" => {
                // The tag follows the last colon, and a tag never holds a `/`.
                let (path, tag) = match rest.rsplit_once(':') {
                    Some((path, "")) => (path, None),
                    Some((path, tag)) if !tag.contains('/') => (path, Some(tag.to_owned())),
                    _ => (rest, None),
                };
                if path.is_empty() {
                    return Err(invalid("missing layout directory"));
                }
                Ok(ImageName::Layout {
                    path: path.into(),
                    tag,
                })
            }
            _ => Err(invalid("unknown transport")),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageName::Docker(reference) => write!(f, "docker://{reference}"),
            ImageName::Layout { path, tag: None } => write!(f, "oci:{path}"),
            ImageName::Layout {
                path,
                tag: Some(tag),
            } => write!(f, "oci:{path}:{tag}"),
        }
    }
}

#[derive(Debug)]
enum Opener {
    Name {
        name: ImageName,
        credentials: Option<Credentials>,
    },
    Source(Arc<dyn ImageSource>),
}

/// The one image this process serves.
#[derive(Debug)]
pub struct ImageBackend {
    opener: Opener,
    platform: Platform,
    source: OnceCell<Arc<dyn ImageSource>>,
    blob_info: Mutex<HashMap<Digest, u64>>,
}

impl ImageBackend {
    /// A backend for the named image.
    pub fn new(name: ImageName, credentials: Option<Credentials>, platform: Platform) -> Self {
        Self::with_opener(Opener::Name { name, credentials }, platform)
    }

    /// A backend over an already constructed source.
    pub fn from_source(source: Arc<dyn ImageSource>, platform: Platform) -> Self {
        Self::with_opener(Opener::Source(source), platform)
    }

    fn with_opener(opener: Opener, platform: Platform) -> Self {
        ImageBackend {
            opener,
            platform,
            source: OnceCell::new(),
            blob_info: Mutex::new(HashMap::new()),
        }
    }

    /// The platform used to pick from image indexes.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Whether the source has been opened.
    pub fn is_connected(&self) -> bool {
        self.source.initialized()
    }

    /// Open the source, once.
    ///
    /// Concurrent callers wait for the same attempt. A failed attempt is not
    /// remembered, so a later call tries again.
    pub async fn ensure_connected(&self) -> ProxyResult<&Arc<dyn ImageSource>> {
        self.source
            .get_or_try_init(|| async {
                let source = match &self.opener {
                    Opener::Name { name, credentials } => {
                        tracing::debug!(image = %name, "opening image source");
                        name.open(credentials.clone())
                    }
                    Opener::Source(source) => source.clone(),
                };
                source.connect().await?;
                tracing::debug!("image source connected");
                Ok(source)
            })
            .await
    }

    /// Fetch the image manifest, resolved to this platform and converted to OCI.
    #[tracing::instrument(skip(self))]
    pub async fn get_manifest(&self) -> ProxyResult<ManifestResult> {
        let source = self.ensure_connected().await?;

        let mut raw = source.fetch_manifest(None).await?;
        let mut kind = manifest::detect(raw.media_type.as_deref(), &raw.bytes)?;
        let mut algorithm = Algorithm::Sha256;

        if kind.is_index() {
            let index = ImageIndex::parse(&raw.bytes)?;
            let entry = index.select(&self.platform)?;
            tracing::debug!(digest = %entry.digest, platform = %self.platform, "selected manifest");

            raw = source.fetch_manifest(Some(&entry.digest)).await?;
            if Digest::of(entry.digest.algorithm(), &raw.bytes) != entry.digest {
                return Err(ProxyError::CorruptedBlob(entry.digest.clone()));
            }
            algorithm = entry.digest.algorithm();
            kind = manifest::detect(
                raw.media_type.as_deref().or(Some(entry.media_type.as_str())),
                &raw.bytes,
            )?;
            if kind.is_index() {
                return Err(ProxyError::manifest("index entry is itself an index"));
            }
        }

        let digest = Digest::of(algorithm, &raw.bytes);
        let (parsed, manifest) = manifest::to_oci(kind, &raw.bytes)?;
        self.remember_sizes(&parsed);

        tracing::trace!(%digest, size = manifest.len(), "manifest ready");
        Ok(ManifestResult {
            digest,
            manifest,
            parsed,
        })
    }

    /// Open a blob. The size falls back to what manifests have told us.
    #[tracing::instrument(skip(self), fields(digest = %digest))]
    pub async fn get_blob(&self, digest: &Digest) -> ProxyResult<Blob> {
        let source = self.ensure_connected().await?;
        let mut blob = source.fetch_blob(digest).await?;
        if blob.size.is_none() {
            blob.size = self.blob_info.lock().get(digest).copied();
        }
        tracing::trace!(size = ?blob.size, "blob opened");
        Ok(blob)
    }

    fn remember_sizes(&self, manifest: &ImageManifest) {
        let mut info = self.blob_info.lock();
        for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
            info.insert(descriptor.digest.clone(), descriptor.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::manifest::fixtures::{descriptor, docker_manifest};
    use crate::manifest::media_types;

    #[test]
    fn parse_image_names() {
        let name: ImageName = "docker://quay.io/fedora/fedora:40".parse().unwrap();
        assert!(matches!(name, ImageName::Docker(ref r) if r.registry() == "quay.io"));
        assert_eq!(name.to_string(), "docker://quay.io/fedora/fedora:40");

        let name: ImageName = "oci:/var/lib/images/app:v1".parse().unwrap();
        assert_eq!(
            name,
            ImageName::Layout {
                path: "/var/lib/images/app".into(),
                tag: Some("v1".into())
            }
        );

        let name: ImageName = "oci:layout".parse().unwrap();
        assert_eq!(name.to_string(), "oci:layout");
    }

    #[test]
    fn layout_paths_may_contain_colons() {
        let name: ImageName = "oci:/srv/c:d/layout:v1".parse().unwrap();
        assert_eq!(
            name,
            ImageName::Layout {
                path: "/srv/c:d/layout".into(),
                tag: Some("v1".into())
            }
        );

        let name: ImageName = "oci:/srv/c:d/layout".parse().unwrap();
        assert_eq!(
            name,
            ImageName::Layout {
                path: "/srv/c:d/layout".into(),
                tag: None
            }
        );
    }

    #[test]
    fn reject_bad_image_names() {
        for bad in ["busybox", "docker:busybox", "ftp://host/x", "oci:", "docker://"] {
            let err = bad.parse::<ImageName>().unwrap_err();
            assert!(matches!(err, ProxyError::ReferenceParse { .. }), "{bad}: {err}");
        }
    }

    #[tokio::test]
    async fn manifest_digest_is_over_original_bytes() {
        let original = docker_manifest(b"{}", b"layer");
        let source = MemorySource::new().with_manifest(
            original.clone(),
            Some(media_types::DOCKER_MANIFEST),
        );
        let backend = ImageBackend::from_source(Arc::new(source), Platform::host());

        let result = backend.get_manifest().await.unwrap();
        assert_eq!(result.digest, Digest::sha256(&original));
        assert_ne!(result.digest, Digest::sha256(&result.manifest));
        assert_eq!(result.parsed.config.media_type, media_types::OCI_CONFIG);
    }

    #[tokio::test]
    async fn index_resolves_to_platform_instance() {
        let instance = docker_manifest(b"{}", b"arm layer");
        let mut entry = descriptor(media_types::DOCKER_MANIFEST, &instance);
        entry.platform = Some(Platform::new("linux", "arm64"));
        let mut other = descriptor(media_types::DOCKER_MANIFEST, b"other");
        other.platform = Some(Platform::new("linux", "amd64"));

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST_LIST,
            "manifests": [other, entry],
        });
        let source = MemorySource::new()
            .with_manifest(Bytes::from(serde_json::to_vec(&index).unwrap()), None)
            .with_instance(instance.clone(), Some(media_types::DOCKER_MANIFEST));

        let backend =
            ImageBackend::from_source(Arc::new(source), Platform::new("linux", "arm64"));
        let result = backend.get_manifest().await.unwrap();
        assert_eq!(result.digest, Digest::sha256(&instance));

        let backend = ImageBackend::from_source(
            Arc::new(MemorySource::new().with_manifest(
                Bytes::from(serde_json::to_vec(&index).unwrap()),
                None,
            )),
            Platform::new("linux", "s390x"),
        );
        assert!(matches!(
            backend.get_manifest().await,
            Err(ProxyError::NoMatchingPlatform(_))
        ));
    }

    #[tokio::test]
    async fn blob_size_falls_back_to_manifest() {
        let config = b"{\"architecture\":\"amd64\"}";
        let source = MemorySource::new()
            .with_manifest(docker_manifest(config, b"layer"), None)
            .without_sizes();
        let config_digest = source.add_blob(Bytes::from_static(config));
        let backend = ImageBackend::from_source(Arc::new(source), Platform::host());

        assert_eq!(backend.get_blob(&config_digest).await.unwrap().size, None);

        backend.get_manifest().await.unwrap();
        let mut blob = backend.get_blob(&config_digest).await.unwrap();
        assert_eq!(blob.size, Some(config.len() as u64));

        let mut content = Vec::new();
        blob.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, config);
    }

    #[tokio::test]
    async fn connects_once() {
        let source = Arc::new(MemorySource::new());
        let backend = ImageBackend::from_source(source.clone(), Platform::host());
        assert!(!backend.is_connected());

        let (a, b) = tokio::join!(backend.ensure_connected(), backend.ensure_connected());
        a.unwrap();
        b.unwrap();
        backend.get_blob(&Digest::sha256(b"nope")).await.unwrap_err();

        assert!(backend.is_connected());
        assert_eq!(source.connections(), 1);
    }
}
