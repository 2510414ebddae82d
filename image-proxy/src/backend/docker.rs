use registry_client::RegistryClient;
use tokio_util::io::StreamReader;

use super::{Blob, ImageSource, RawManifest};
use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};

/// An image in a container registry.
#[derive(Debug, Clone)]
pub struct DockerSource {
    client: RegistryClient,
}

impl DockerSource {
    /// Pull through `client`.
    pub fn new(client: RegistryClient) -> Self {
        DockerSource { client }
    }
}

#[async_trait::async_trait]
impl ImageSource for DockerSource {
    #[tracing::instrument(skip(self), fields(image = %self.client.reference()))]
    async fn connect(&self) -> ProxyResult<()> {
        self.client
            .ping()
            .await
            .map_err(|err| ProxyError::BackendConnection(err.into()))
    }

    async fn fetch_manifest(&self, instance: Option<&Digest>) -> ProxyResult<RawManifest> {
        let instance = instance.map(Digest::to_string);
        let manifest = self
            .client
            .manifest(instance.as_deref())
            .await
            .map_err(ProxyError::backend)?;

        Ok(RawManifest {
            bytes: manifest.bytes,
            media_type: manifest.media_type,
        })
    }

    async fn fetch_blob(&self, digest: &Digest) -> ProxyResult<Blob> {
        let blob = self
            .client
            .blob(&digest.to_string())
            .await
            .map_err(|err| match err {
                err if err.is_not_found() => ProxyError::BlobNotFound(digest.clone()),
                err => ProxyError::backend(err),
            })?;

        Ok(Blob {
            reader: Box::pin(StreamReader::new(blob.stream)),
            size: blob.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use registry_client::mock::{MockResponse, MockService};
    use registry_client::ImageReference;
    use tokio::io::AsyncReadExt as _;

    use super::*;

    fn source(mock: &MockService) -> DockerSource {
        let reference = ImageReference::parse("registry.test/app:1").unwrap();
        DockerSource::new(RegistryClient::new_with_inner_service(reference, mock.clone()))
    }

    #[tokio::test]
    async fn unreachable_registry_is_a_connection_error() {
        let mock = MockService::new();
        mock.add(
            "/v2/",
            MockResponse::new(StatusCode::SERVICE_UNAVAILABLE, http::HeaderMap::new(), ""),
        );

        assert!(matches!(
            source(&mock).connect().await,
            Err(ProxyError::BackendConnection(_))
        ));
    }

    #[tokio::test]
    async fn fetches_instance_by_digest() {
        let digest = Digest::sha256(b"{}");
        let mock = MockService::new();
        mock.add(
            &format!("/v2/app/manifests/{digest}"),
            MockResponse::ok("{}").header(
                http::header::CONTENT_TYPE,
                "application/vnd.oci.image.manifest.v1+json",
            ),
        );

        let manifest = source(&mock).fetch_manifest(Some(&digest)).await.unwrap();
        assert_eq!(&manifest.bytes[..], b"{}");
    }

    #[tokio::test]
    async fn blobs_stream_and_missing_blobs_are_not_found() {
        let present = Digest::sha256(b"layer");
        let absent = Digest::sha256(b"absent");
        let mock = MockService::new();
        mock.add(
            &format!("/v2/app/blobs/{present}"),
            MockResponse::ok("layer").header(http::header::CONTENT_LENGTH, "5"),
        );
        mock.add(
            &format!("/v2/app/blobs/{absent}"),
            MockResponse::new(StatusCode::NOT_FOUND, http::HeaderMap::new(), ""),
        );

        let source = source(&mock);
        let mut blob = source.fetch_blob(&present).await.unwrap();
        assert_eq!(blob.size, Some(5));
        let mut content = Vec::new();
        blob.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"layer");

        assert!(matches!(
            source.fetch_blob(&absent).await,
            Err(ProxyError::BlobNotFound(d)) if d == absent
        ));
    }
}
