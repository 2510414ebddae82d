//! Session setup: which channel requests arrive on, and which protocol they speak.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::ImageProxy;
use crate::rpc::SeqPacket;

/// Where a session's requests come from.
#[derive(Debug)]
pub enum Transport {
    /// An inherited, already connected socket
    Fd(OwnedFd),
    /// A TCP listener on the loopback interface
    Port(u16),
    /// Standard input and output
    Stdio,
}

impl Transport {
    /// Pick a transport: a descriptor wins over a port, and stdio is the fallback.
    pub fn select(fd: Option<OwnedFd>, port: Option<u16>) -> Self {
        match (fd, port) {
            (Some(fd), _) => Transport::Fd(fd),
            (None, Some(port)) => Transport::Port(port),
            (None, None) => Transport::Stdio,
        }
    }
}

/// The wire protocol spoken on the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Protocol {
    /// HTTP/1
    #[default]
    Http,
    /// JSON messages with descriptor passing, over a seqpacket socket
    Rpc,
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "rpc" => Ok(Protocol::Rpc),
            other => Err(ProxyError::InvalidRequest(format!(
                "unknown protocol {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "http",
            Protocol::Rpc => "rpc",
        })
    }
}

/// Where a session is in its life.
///
/// Errors while dispatching a request return the session to
/// `AwaitingRequest`; only a quit request or end-of-stream shut it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has happened yet
    Idle,
    /// Waiting for the next request
    AwaitingRequest,
    /// Handling a request
    Dispatching,
    /// Done; no further requests are read
    ShuttingDown,
}

impl SessionState {
    /// Move to `next`.
    pub fn advance(self, next: SessionState) -> SessionState {
        tracing::trace!(from = ?self, to = ?next, "session state");
        next
    }
}

/// The state of one session, shared with the code serving its requests.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    state: Arc<Mutex<SessionState>>,
}

impl SessionTracker {
    /// A session which hasn't started yet.
    pub fn new() -> Self {
        SessionTracker {
            state: Arc::new(Mutex::new(SessionState::Idle)),
        }
    }

    /// The current state.
    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next`, unless the session is already shutting down.
    pub fn advance(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::ShuttingDown {
            *state = state.advance(next);
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a session to completion.
pub async fn run(proxy: ImageProxy, transport: Transport, protocol: Protocol) -> ProxyResult<()> {
    tracing::debug!(?transport, %protocol, "starting session");

    let outcome = match (protocol, transport) {
        (Protocol::Rpc, Transport::Fd(fd)) => {
            return crate::rpc::serve(proxy, SeqPacket::new(fd)?).await;
        }
        (Protocol::Rpc, _) => {
            return Err(ProxyError::InvalidRequest(
                "the rpc protocol needs a socket descriptor".into(),
            ))
        }
        (Protocol::Http, Transport::Fd(fd)) => {
            let stream = std::os::unix::net::UnixStream::from(fd);
            stream.set_nonblocking(true)?;
            serve_one(&proxy, tokio::net::UnixStream::from_std(stream)?).await
        }
        (Protocol::Http, Transport::Port(port)) => serve_tcp(&proxy, port).await,
        (Protocol::Http, Transport::Stdio) => serve_one(&proxy, Stdio::new()).await,
    };

    proxy.transfers().report_unfinished();
    outcome
}

async fn serve_one<IO>(proxy: &ImageProxy, io: IO) -> ProxyResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    crate::http::serve_connection(proxy.clone(), io).await
}

#[tracing::instrument(skip(proxy))]
async fn serve_tcp(proxy: &ImageProxy, port: u16) -> ProxyResult<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    serve_listener(proxy, listener).await
}

/// Serve HTTP on every connection `listener` accepts, until a quit request.
///
/// The listener is closed as soon as the quit arrives. Connections already
/// accepted finish their in-flight responses first.
pub async fn serve_listener(proxy: &ImageProxy, listener: TcpListener) -> ProxyResult<()> {
    tracing::info!(address = %listener.local_addr()?, "listening");

    let shutdown = proxy.shutdown_token();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "accepted connection");
                let proxy = proxy.clone();
                connections.spawn(async move {
                    if let Err(error) = crate::http::serve_connection(proxy, stream).await {
                        tracing::warn!(%peer, %error, "connection failed");
                    }
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Standard input and output as one duplex stream.
#[pin_project]
#[derive(Debug)]
pub struct Stdio {
    #[pin]
    stdin: tokio::io::Stdin,
    #[pin]
    stdout: tokio::io::Stdout,
}

impl Stdio {
    /// Join this process's stdin and stdout.
    pub fn new() -> Self {
        Stdio {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for Stdio {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stdin.poll_read(cx, buf)
    }
}

impl AsyncWrite for Stdio {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stdout.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stdout.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stdout.poll_shutdown(cx)
    }
}
