//! Background blob transfers.
//!
//! A transfer copies bytes into the write end of a pipe on its own task, while
//! the read end goes to the caller. The outcome of the copy is held until the
//! caller asks for it with [`TransferManager::finish`], which is the only way
//! to learn whether the data that came through the pipe was good.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::Instrument as _;

use crate::error::{ProxyError, ProxyResult};
use crate::verify::VerifiedReader;

/// Names one in-flight transfer.
///
/// Identifiers are minted by the manager and never reused within a process.
/// On the wire, `0` means "no transfer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(NonZeroU32);

impl TransferId {
    /// The identifier as sent on the wire.
    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// Read an identifier from the wire; `0` is not one.
    pub fn from_wire(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(TransferId)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open a pipe for a transfer.
///
/// Returns the read end, for handing to the caller, and the write end
/// registered with the runtime. Both ends are close-on-exec.
pub fn conduit() -> ProxyResult<(OwnedFd, pipe::Sender)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let sender = pipe::Sender::from_owned_fd(write)?;
    Ok((read, sender))
}

/// Copy a verified blob into `sink`, then check the digest.
///
/// The sink is flushed and dropped before returning, so the reader sees
/// end-of-file whatever the outcome.
pub async fn send_verified<R, W>(mut reader: VerifiedReader<R>, mut sink: W) -> ProxyResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut sink).await?;
    sink.flush().await?;
    drop(sink);

    reader.verify()?;
    tracing::trace!(bytes = copied, digest = %reader.expected(), "blob verified");
    Ok(copied)
}

/// Registry of running transfers.
#[derive(Debug)]
pub struct TransferManager {
    next: AtomicU32,
    transfers: Mutex<HashMap<TransferId, JoinHandle<ProxyResult<()>>>>,
    timeout: Option<Duration>,
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TransferManager {
    /// A manager whose transfers fail if they take longer than `timeout`.
    ///
    /// With no timeout a stalled source stalls its transfer forever.
    pub fn new(timeout: Option<Duration>) -> Self {
        TransferManager {
            next: AtomicU32::new(1),
            transfers: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn mint(&self) -> TransferId {
        // Skips zero if the counter ever wraps.
        loop {
            if let Some(id) = TransferId::from_wire(self.next.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }

    /// Run `copy` in the background and register it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, copy: F) -> TransferId
    where
        F: Future<Output = ProxyResult<()>> + Send + 'static,
    {
        let id = self.mint();
        let timeout = self.timeout;

        let task = async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, copy).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("transfer did not complete within {limit:?}"),
                    ))),
                },
                None => copy.await,
            };
            match &outcome {
                Ok(()) => tracing::trace!("transfer complete"),
                Err(error) => tracing::debug!(%error, "transfer failed"),
            }
            outcome
        };

        let handle = tokio::spawn(task.instrument(tracing::debug_span!("transfer", %id)));
        self.transfers.lock().insert(id, handle);
        tracing::trace!(%id, "transfer started");
        id
    }

    /// Wait for a transfer and collect its outcome.
    ///
    /// The transfer is forgotten once finished; finishing it again is
    /// [`ProxyError::NoSuchTransfer`].
    #[tracing::instrument(skip(self))]
    pub async fn finish(&self, id: TransferId) -> ProxyResult<()> {
        let handle = self
            .transfers
            .lock()
            .remove(&id)
            .ok_or(ProxyError::NoSuchTransfer(id))?;

        match handle.await {
            Ok(outcome) => outcome,
            Err(error) if error.is_panic() => Err(ProxyError::Io(io::Error::other(format!(
                "transfer {id} panicked"
            )))),
            Err(_) => Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("transfer {id} was cancelled"),
            ))),
        }
    }

    /// Number of transfers started but not finished.
    pub fn pending(&self) -> usize {
        self.transfers.lock().len()
    }

    /// Report transfers nobody finished. Their tasks keep running.
    pub fn report_unfinished(&self) -> usize {
        let transfers = self.transfers.lock();
        if !transfers.is_empty() {
            let mut ids: Vec<_> = transfers.keys().map(TransferId::get).collect();
            ids.sort_unstable();
            tracing::warn!(?ids, "session ended with unfinished transfers");
        }
        transfers.len()
    }
}
