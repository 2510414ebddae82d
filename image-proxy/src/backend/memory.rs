use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;

use super::{Blob, BlobReader, ImageSource, RawManifest};
use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};

/// An image held entirely in memory.
///
/// Useful for tests and demos. Besides plain blobs, a source can be handed
/// one-shot readers, which lets a test control exactly when blob bytes
/// become available.
#[derive(Debug, Default)]
pub struct MemorySource {
    manifest: Option<RawManifest>,
    instances: Mutex<HashMap<Digest, RawManifest>>,
    blobs: Mutex<HashMap<Digest, Bytes>>,
    readers: Mutex<HashMap<Digest, (OneShot, Option<u64>)>>,
    hide_sizes: bool,
    connections: AtomicUsize,
}

struct OneShot(BlobReader);

impl std::fmt::Debug for OneShot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OneShot")
    }
}

impl MemorySource {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the top level manifest.
    pub fn with_manifest(mut self, bytes: Bytes, media_type: Option<&str>) -> Self {
        self.manifest = Some(RawManifest {
            bytes,
            media_type: media_type.map(str::to_owned),
        });
        self
    }

    /// Add a manifest reachable by its digest, e.g. an index entry.
    pub fn with_instance(self, bytes: Bytes, media_type: Option<&str>) -> Self {
        self.instances.lock().insert(
            Digest::sha256(&bytes),
            RawManifest {
                bytes,
                media_type: media_type.map(str::to_owned),
            },
        );
        self
    }

    /// Report every blob with an unknown size.
    pub fn without_sizes(mut self) -> Self {
        self.hide_sizes = true;
        self
    }

    /// Store a blob under its own digest.
    pub fn add_blob(&self, content: Bytes) -> Digest {
        let digest = Digest::sha256(&content);
        self.blobs.lock().insert(digest.clone(), content);
        digest
    }

    /// Store content under any digest, matching or not.
    pub fn insert_blob(&self, digest: Digest, content: Bytes) {
        self.blobs.lock().insert(digest, content);
    }

    /// Serve `reader` the next time `digest` is fetched, and only then.
    pub fn insert_reader<R>(&self, digest: Digest, reader: R, size: Option<u64>)
    where
        R: AsyncRead + Send + 'static,
    {
        self.readers
            .lock()
            .insert(digest, (OneShot(Box::pin(reader)), size));
    }

    /// How many times the source has been connected.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ImageSource for MemorySource {
    async fn connect(&self) -> ProxyResult<()> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_manifest(&self, instance: Option<&Digest>) -> ProxyResult<RawManifest> {
        let manifest = match instance {
            None => self.manifest.clone(),
            Some(digest) => self.instances.lock().get(digest).cloned(),
        };
        manifest.ok_or_else(|| ProxyError::backend("manifest not found"))
    }

    async fn fetch_blob(&self, digest: &Digest) -> ProxyResult<Blob> {
        if let Some((OneShot(reader), size)) = self.readers.lock().remove(digest) {
            return Ok(Blob {
                reader,
                size: size.filter(|_| !self.hide_sizes),
            });
        }

        let content = self
            .blobs
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| ProxyError::BlobNotFound(digest.clone()))?;
        let size = (!self.hide_sizes).then_some(content.len() as u64);

        Ok(Blob {
            reader: Box::pin(Cursor::new(content)),
            size,
        })
    }
}
