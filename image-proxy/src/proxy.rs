//! The proxy session: one image, its backend and its transfers.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use registry_client::Credentials;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;

use crate::backend::{BlobReader, ImageBackend, ImageName, ImageSource};
use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};
use crate::manifest::{ManifestResult, Platform};
use crate::transfer::{self, TransferId, TransferManager};
use crate::verify::VerifiedReader;

/// A blob ready to be read, checked against its digest as it goes.
pub type VerifiedBlob = VerifiedReader<BlobReader>;

/// A transfer running in the background, and the pipe it writes to.
#[derive(Debug)]
pub struct PendingTransfer {
    /// Handle for [`ImageProxy::finish`]
    pub id: TransferId,
    /// Read end of the pipe
    pub pipe: OwnedFd,
}

/// Builder for an [`ImageProxy`].
#[derive(Debug, Default)]
pub struct ImageProxyBuilder {
    image: Option<ImageName>,
    source: Option<Arc<dyn ImageSource>>,
    credentials: Option<Credentials>,
    platform: Option<Platform>,
    transfer_timeout: Option<Duration>,
    quiet: bool,
}

impl ImageProxyBuilder {
    /// Create a new proxy builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the named image
    pub fn image(mut self, image: ImageName) -> Self {
        self.image = Some(image);
        self
    }

    /// Serve an image from a ready-made source
    pub fn source(mut self, source: Arc<dyn ImageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Credentials for registries which ask for them
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Platform to pick from multi-platform images, the host's by default
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Fail background transfers which run longer than `timeout`
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    /// Don't log request errors
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Build the proxy. The image is not contacted until first use.
    pub fn build(self) -> ProxyResult<ImageProxy> {
        let platform = self.platform.unwrap_or_else(Platform::host);
        let backend = match (self.source, self.image) {
            (Some(source), _) => ImageBackend::from_source(source, platform),
            (None, Some(image)) => ImageBackend::new(image, self.credentials, platform),
            (None, None) => {
                return Err(ProxyError::ReferenceParse {
                    reference: String::new(),
                    reason: "no image configured".into(),
                })
            }
        };

        Ok(ImageProxy {
            inner: Arc::new(Inner {
                backend,
                transfers: TransferManager::new(self.transfer_timeout),
                quiet: self.quiet,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    backend: ImageBackend,
    transfers: TransferManager,
    quiet: bool,
    shutdown: CancellationToken,
}

/// Serves one image to one caller.
///
/// Cheap to clone; clones share the backend, the transfers and the shutdown
/// flag.
#[derive(Debug, Clone)]
pub struct ImageProxy {
    inner: Arc<Inner>,
}

impl ImageProxy {
    /// Start building a proxy
    pub fn builder() -> ImageProxyBuilder {
        ImageProxyBuilder::new()
    }

    /// The image backend
    pub fn backend(&self) -> &ImageBackend {
        &self.inner.backend
    }

    /// The transfer registry
    pub fn transfers(&self) -> &TransferManager {
        &self.inner.transfers
    }

    /// Whether request errors are kept out of the log
    pub fn is_quiet(&self) -> bool {
        self.inner.quiet
    }

    /// Fires when the session should end
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Ask the session to end after the current request.
    pub fn request_shutdown(&self) {
        tracing::debug!("shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Log a request failure, unless quiet.
    pub(crate) fn report(&self, error: &ProxyError) {
        if !self.inner.quiet {
            tracing::error!(%error, "request failed");
        }
    }

    /// The image manifest, as OCI.
    pub async fn manifest(&self) -> ProxyResult<ManifestResult> {
        self.inner.backend.get_manifest().await
    }

    /// Open a blob for verified reading, with its size when known.
    pub async fn open_blob(&self, digest: &Digest) -> ProxyResult<(VerifiedBlob, Option<u64>)> {
        let blob = self.inner.backend.get_blob(digest).await?;
        Ok((VerifiedReader::new(blob.reader, digest.clone()), blob.size))
    }

    /// Open the image configuration, which the manifest names.
    pub async fn open_config(&self) -> ProxyResult<(Digest, VerifiedBlob, Option<u64>)> {
        let manifest = self.manifest().await?;
        let digest = manifest.parsed.config.digest;
        let (reader, size) = self.open_blob(&digest).await?;
        Ok((digest, reader, size.or(Some(manifest.parsed.config.size))))
    }

    /// Start copying a blob into a new pipe.
    #[tracing::instrument(skip(self), fields(digest = %digest))]
    pub async fn start_blob(&self, digest: &Digest) -> ProxyResult<(Option<u64>, PendingTransfer)> {
        let (reader, size) = self.open_blob(digest).await?;
        let transfer = self.start_verified(reader)?;
        Ok((size, transfer))
    }

    /// Start copying the configuration blob into a new pipe.
    pub async fn start_config(&self) -> ProxyResult<(Digest, PendingTransfer)> {
        let (digest, reader, _) = self.open_config().await?;
        let transfer = self.start_verified(reader)?;
        Ok((digest, transfer))
    }

    /// Start writing the manifest into a new pipe.
    pub async fn start_manifest(&self) -> ProxyResult<(Digest, PendingTransfer)> {
        let manifest = self.manifest().await?;
        let transfer = self.start_bytes(manifest.manifest)?;
        Ok((manifest.digest, transfer))
    }

    /// Wait for a transfer and collect its outcome.
    pub async fn finish(&self, id: TransferId) -> ProxyResult<()> {
        self.inner.transfers.finish(id).await
    }

    fn start_verified(&self, reader: VerifiedBlob) -> ProxyResult<PendingTransfer> {
        let (pipe, sink) = transfer::conduit()?;
        let id = self
            .inner
            .transfers
            .start(async move { transfer::send_verified(reader, sink).await.map(|_| ()) });
        Ok(PendingTransfer { id, pipe })
    }

    fn start_bytes(&self, content: Bytes) -> ProxyResult<PendingTransfer> {
        let (pipe, mut sink) = transfer::conduit()?;
        let id = self.inner.transfers.start(async move {
            sink.write_all(&content).await?;
            sink.flush().await?;
            Ok::<_, ProxyError>(())
        });
        Ok(PendingTransfer { id, pipe })
    }
}
