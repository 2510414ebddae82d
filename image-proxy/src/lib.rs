//! # Container image proxy
//!
//! Serves the manifest and blobs of one container image to a local caller,
//! streaming blobs straight from the source without storing them.
//!
//! Two protocols are available:
//!
//! - HTTP/1 over an inherited socket, stdio, or a loopback TCP port
//!   ([`http`]).
//! - JSON requests over a `SOCK_SEQPACKET` socket, with blob data delivered
//!   through pipes passed alongside the replies ([`rpc`]).
//!
//! Every blob is checked against its digest while it streams. Multi-platform
//! images are resolved to the host platform, and Docker manifests are served
//! converted to OCI, while the reported manifest digest is always that of the
//! document as the source served it.
//!
//! ## Example
//!
//! ```no_run
//! use image_proxy::{ImageProxy, Protocol, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = ImageProxy::builder()
//!     .image("docker://quay.io/fedora/fedora:latest".parse()?)
//!     .build()?;
//!
//! image_proxy::session::run(proxy, Transport::Port(8080), Protocol::Http).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod digest;
mod error;
pub mod http;
pub mod manifest;
mod proxy;
pub mod rpc;
pub mod session;
pub mod transfer;
pub mod verify;

pub use self::backend::{ImageBackend, ImageName, ImageSource, MemorySource};
pub use self::digest::Digest;
pub use self::error::{BoxError, ProxyError, ProxyResult};
pub use self::manifest::{ManifestResult, Platform};
pub use self::proxy::{ImageProxy, ImageProxyBuilder, PendingTransfer, VerifiedBlob};
pub use self::session::{Protocol, SessionState, SessionTracker, Transport};
pub use self::transfer::{TransferId, TransferManager};
