//! Descriptor-passing RPC interface.
//!
//! Requests and replies are small JSON documents, one per `SOCK_SEQPACKET`
//! message:
//!
//! ```text
//! -> {"method": "GetBlob", "args": ["sha256:..."]}
//! <- {"success": true, "value": 1234, "pipeid": 3, "error": ""}
//! ```
//!
//! Bulk data never travels on the socket. Instead a reply with a non-zero
//! `pipeid` carries the read end of a pipe, and the data is written into the
//! pipe in the background. The caller reads the pipe to the end and then
//! sends `FinishPipe` with the `pipeid` to learn whether the data was good.

use std::io;
use std::os::fd::AsFd as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::{ImageProxy, PendingTransfer};
use crate::session::SessionState;
use crate::transfer::TransferId;

mod socket;

pub use self::socket::SeqPacket;

/// Largest message either side may send.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Version reported by `Initialize`.
pub const PROTOCOL_VERSION: &str = "0.2.0";

/// A request as sent by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name
    pub method: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Request {
    /// A request for `method` with `args`.
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Request {
            method: method.into(),
            args,
        }
    }
}

/// A reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the request succeeded
    pub success: bool,
    /// The result, `null` on failure
    pub value: Value,
    /// Transfer whose pipe accompanies this reply, or 0
    pub pipeid: u32,
    /// Error text on failure, empty on success
    pub error: String,
}

impl Reply {
    fn ok(value: Value, transfer: Option<&PendingTransfer>) -> Self {
        Reply {
            success: true,
            value,
            pipeid: transfer.map(|t| t.id.get()).unwrap_or(0),
            error: String::new(),
        }
    }

    fn failed(error: &ProxyError) -> Self {
        Reply {
            success: false,
            value: Value::Null,
            pipeid: 0,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Method {
    Initialize,
    GetManifest,
    GetConfig,
    GetBlob(Digest),
    FinishPipe(TransferId),
    Shutdown,
}

impl Method {
    fn decode(message: &[u8]) -> ProxyResult<Self> {
        let request: Request = serde_json::from_slice(message)
            .map_err(|err| ProxyError::InvalidRequest(format!("malformed request: {err}")))?;

        let Request { method, args } = request;
        match (method.as_str(), args.as_slice()) {
            ("Initialize", []) => Ok(Method::Initialize),
            ("GetManifest", []) => Ok(Method::GetManifest),
            ("GetConfig", []) => Ok(Method::GetConfig),
            ("GetBlob", [Value::String(digest)]) => Ok(Method::GetBlob(digest.parse()?)),
            ("FinishPipe", [Value::Number(id)]) => {
                let id = id
                    .as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| ProxyError::InvalidRequest(format!("invalid pipeid {id}")))?;
                TransferId::from_wire(id)
                    .map(Method::FinishPipe)
                    .ok_or_else(|| ProxyError::InvalidRequest("pipeid 0 names no transfer".into()))
            }
            ("Shutdown", []) => Ok(Method::Shutdown),
            (
                "Initialize" | "GetManifest" | "GetConfig" | "GetBlob" | "FinishPipe" | "Shutdown",
                _,
            ) => Err(ProxyError::InvalidRequest(format!(
                "invalid arguments for {method}"
            ))),
            _ => Err(ProxyError::InvalidRequest(format!("unknown method {method:?}"))),
        }
    }
}

/// Answer one request.
///
/// Errors become failure replies; they never end the session.
pub async fn dispatch(proxy: &ImageProxy, message: &[u8]) -> (Reply, Option<PendingTransfer>) {
    match handle(proxy, message).await {
        Ok((value, transfer)) => (Reply::ok(value, transfer.as_ref()), transfer),
        Err(error) => {
            proxy.report(&error);
            (Reply::failed(&error), None)
        }
    }
}

async fn handle(
    proxy: &ImageProxy,
    message: &[u8],
) -> ProxyResult<(Value, Option<PendingTransfer>)> {
    let method = Method::decode(message)?;
    tracing::debug!(?method, "dispatching");

    match method {
        Method::Initialize => Ok((Value::from(PROTOCOL_VERSION), None)),
        Method::GetManifest => {
            let (digest, transfer) = proxy.start_manifest().await?;
            Ok((Value::from(digest.to_string()), Some(transfer)))
        }
        Method::GetConfig => {
            let (digest, transfer) = proxy.start_config().await?;
            Ok((Value::from(digest.to_string()), Some(transfer)))
        }
        Method::GetBlob(digest) => {
            let (size, transfer) = proxy.start_blob(&digest).await?;
            let size = size
                .and_then(|size| i64::try_from(size).ok())
                .unwrap_or(-1);
            Ok((Value::from(size), Some(transfer)))
        }
        Method::FinishPipe(id) => {
            proxy.finish(id).await?;
            Ok((Value::Null, None))
        }
        Method::Shutdown => {
            proxy.request_shutdown();
            Ok((Value::Null, None))
        }
    }
}

/// Serve requests on `socket` until `Shutdown` or until the peer hangs up.
///
/// Requests are handled strictly one at a time. A message too large for the
/// receive buffer is refused with a failed reply. Any other failure to read
/// or write the socket ends the session with an error.
#[tracing::instrument(skip_all)]
pub async fn serve(proxy: ImageProxy, socket: SeqPacket) -> ProxyResult<()> {
    let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
    let mut state = SessionState::Idle;

    loop {
        state = state.advance(SessionState::AwaitingRequest);
        let size = match socket.recv(&mut buffer).await {
            Ok((size, _stray)) => size,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                let error = ProxyError::InvalidRequest("message too large".into());
                proxy.report(&error);
                socket.send(&encode(&Reply::failed(&error))?, None).await?;
                continue;
            }
            Err(error) => return Err(error.into()),
        };
        if size == 0 {
            tracing::debug!("peer closed the socket");
            break;
        }

        state = state.advance(SessionState::Dispatching);
        let (reply, transfer) = dispatch(&proxy, &buffer[..size]).await;
        let reply = encode(&reply)?;
        socket
            .send(&reply, transfer.as_ref().map(|t| t.pipe.as_fd()))
            .await?;
        // Our copy of the read end closes here; the caller holds the other.
        drop(transfer);

        if proxy.is_shutting_down() {
            break;
        }
    }

    state.advance(SessionState::ShuttingDown);
    proxy.transfers().report_unfinished();
    Ok(())
}

fn encode(reply: &Reply) -> io::Result<Vec<u8>> {
    serde_json::to_vec(reply).map_err(io::Error::from)
}
