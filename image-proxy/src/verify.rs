//! Streaming digest verification.
//!
//! [`VerifiedReader`] sits between a blob source and whatever consumes the
//! blob. Bytes pass through untouched while a running hash is kept on the
//! side; once the source reports end-of-stream the hash is compared to the
//! expected digest. Nothing is buffered beyond the caller's read buffer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::{Digest, DigestHasher};
use crate::error::{ProxyError, ProxyResult};

/// Progress of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierState {
    /// End-of-stream has not been seen yet
    Accumulating,
    /// The stream hashed to the expected digest
    Verified,
    /// The stream hashed to something else
    Mismatched {
        /// What the content actually hashed to
        actual: Digest,
    },
}

/// An [`AsyncRead`] adapter which checks its content against a digest.
#[pin_project]
#[derive(Debug)]
pub struct VerifiedReader<R> {
    #[pin]
    inner: R,
    expected: Digest,
    hasher: Option<DigestHasher>,
    state: VerifierState,
    consumed: u64,
}

impl<R> VerifiedReader<R> {
    /// Wrap `inner`, expecting its content to hash to `expected`.
    pub fn new(inner: R, expected: Digest) -> Self {
        let hasher = expected.algorithm().hasher();
        Self {
            inner,
            expected,
            hasher: Some(hasher),
            state: VerifierState::Accumulating,
            consumed: 0,
        }
    }

    /// The digest the content must match.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Number of bytes passed through so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Current verification state.
    pub fn state(&self) -> &VerifierState {
        &self.state
    }

    /// True only once the whole stream has been read and matched.
    pub fn is_verified(&self) -> bool {
        self.state == VerifierState::Verified
    }

    /// Check the outcome.
    ///
    /// A stream which has not been read to the end is never accepted.
    pub fn verify(&self) -> ProxyResult<()> {
        match &self.state {
            VerifierState::Verified => Ok(()),
            VerifierState::Mismatched { actual } => {
                tracing::warn!(expected = %self.expected, %actual, "digest mismatch");
                Err(ProxyError::CorruptedBlob(self.expected.clone()))
            }
            VerifierState::Accumulating => Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("blob {} was not read to the end", self.expected),
            ))),
        }
    }
}

impl<R: AsyncRead> AsyncRead for VerifiedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];

        if !chunk.is_empty() {
            *this.consumed += chunk.len() as u64;
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(chunk);
            }
        } else if buf.remaining() > 0 {
            // A zero-length read into a non-full buffer is end-of-stream.
            if let Some(hasher) = this.hasher.take() {
                let actual = hasher.finish();
                *this.state = if actual == *this.expected {
                    VerifierState::Verified
                } else {
                    VerifierState::Mismatched { actual }
                };
            }
        }

        Poll::Ready(Ok(()))
    }
}
