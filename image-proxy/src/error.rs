//! Error types for the proxy

use std::io;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;
use crate::manifest::Platform;
use crate::transfer::TransferId;

/// Boxed error from an image source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error types for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The image name given at startup could not be parsed
    #[error("invalid image reference {reference:?}: {reason}")]
    ReferenceParse {
        /// The reference as given
        reference: String,
        /// What was wrong with it
        reason: String,
    },

    /// The image source could not be opened
    #[error("failed to open image source: {0}")]
    BackendConnection(#[source] BoxError),

    /// The image source failed while serving a request
    #[error("image source error: {0}")]
    Backend(#[source] BoxError),

    /// The manifest could not be parsed or converted
    #[error("invalid manifest: {0}")]
    ManifestDecode(String),

    /// The image index has no entry for the requested platform
    #[error("no manifest for platform {0}")]
    NoMatchingPlatform(Platform),

    /// The blob does not exist in the image source
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// A digest string was malformed
    #[error("invalid digest {digest:?}: {reason}")]
    DigestParse {
        /// The digest as given
        digest: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Blob content did not hash to its digest
    #[error("corrupted blob: content does not match {0}")]
    CorruptedBlob(Digest),

    /// No transfer is registered under the handle
    #[error("no such transfer: {0}")]
    NoSuchTransfer(TransferId),

    /// A protocol request was malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub(crate) fn backend<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProxyError::Backend(error.into())
    }

    pub(crate) fn manifest(message: impl Into<String>) -> Self {
        ProxyError::ManifestDecode(message.into())
    }
}

impl From<nix::Error> for ProxyError {
    fn from(errno: nix::Error) -> Self {
        ProxyError::Io(errno.into())
    }
}

impl From<registry_client::ReferenceError> for ProxyError {
    fn from(error: registry_client::ReferenceError) -> Self {
        ProxyError::ReferenceParse {
            reference: error.reference,
            reason: error.reason.to_owned(),
        }
    }
}

/// Every handler failure is a `500` carrying the error text.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
