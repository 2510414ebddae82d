use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use super::{Blob, ImageSource, RawManifest};
use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};
use crate::manifest::ImageIndex;

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// An image stored in an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct LayoutSource {
    root: Utf8PathBuf,
    tag: Option<String>,
}

impl LayoutSource {
    /// The image tagged `tag` in the layout at `root`.
    ///
    /// Without a tag the layout must hold exactly one image.
    pub fn new(root: impl Into<Utf8PathBuf>, tag: Option<String>) -> Self {
        LayoutSource {
            root: root.into(),
            tag,
        }
    }

    /// The layout directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().name())
            .join(digest.hex())
    }

    async fn read_index(&self) -> ProxyResult<ImageIndex> {
        let path = self.root.join("index.json");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| ProxyError::backend(format!("{path}: {err}")))?;
        ImageIndex::parse(&bytes)
    }

    async fn read_blob(&self, digest: &Digest) -> ProxyResult<Bytes> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(ProxyError::BlobNotFound(digest.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl ImageSource for LayoutSource {
    #[tracing::instrument(skip(self), fields(root = %self.root))]
    async fn connect(&self) -> ProxyResult<()> {
        let path = self.root.join("oci-layout");
        let marker = tokio::fs::read(&path)
            .await
            .map_err(|err| ProxyError::BackendConnection(format!("{path}: {err}").into()))?;
        let marker: LayoutMarker = serde_json::from_slice(&marker)
            .map_err(|err| ProxyError::BackendConnection(format!("{path}: {err}").into()))?;

        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(ProxyError::BackendConnection(
                format!(
                    "unsupported image layout version {}",
                    marker.image_layout_version
                )
                .into(),
            ));
        }
        Ok(())
    }

    async fn fetch_manifest(&self, instance: Option<&Digest>) -> ProxyResult<RawManifest> {
        if let Some(digest) = instance {
            return Ok(RawManifest {
                bytes: self.read_blob(digest).await?,
                media_type: None,
            });
        }

        let index = self.read_index().await?;
        let entry = match &self.tag {
            Some(tag) => index.manifests.iter().find(|d| {
                d.annotations
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .is_some_and(|name| name == tag)
            }),
            None if index.manifests.len() == 1 => index.manifests.first(),
            None => {
                return Err(ProxyError::backend(format!(
                    "layout {} holds {} images, name one with a tag",
                    self.root,
                    index.manifests.len()
                )))
            }
        };
        let entry = entry.ok_or_else(|| {
            ProxyError::backend(format!(
                "no image tagged {:?} in {}",
                self.tag.as_deref().unwrap_or_default(),
                self.root
            ))
        })?;

        tracing::trace!(digest = %entry.digest, "layout manifest");
        Ok(RawManifest {
            bytes: self.read_blob(&entry.digest).await?,
            media_type: Some(entry.media_type.clone()),
        })
    }

    async fn fetch_blob(&self, digest: &Digest) -> ProxyResult<Blob> {
        let file = match tokio::fs::File::open(self.blob_path(digest)).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ProxyError::BlobNotFound(digest.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();

        Ok(Blob {
            reader: Box::pin(file),
            size: Some(size),
        })
    }
}
