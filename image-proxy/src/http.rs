//! HTTP/1 interface.
//!
//! | Request             | Response                                               |
//! |---------------------|--------------------------------------------------------|
//! | `GET /manifest`     | OCI manifest, `Manifest-Digest` of the original         |
//! | `GET /config`       | image configuration, `Config-Digest`                   |
//! | `GET /blobs/{dgst}` | blob bytes, verified as they stream                    |
//! | `POST /quit`        | `200`, then the connection is closed                   |
//!
//! Methods other than `GET` and `POST` are `405` wherever they are sent,
//! including `HEAD`. Any other path is `400`, a known path with the wrong
//! method `405`, and any failure `500` with the error as the body.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite};

use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};
use crate::manifest::media_types;
use crate::proxy::{ImageProxy, VerifiedBlob};
use crate::session::{SessionState, SessionTracker};

/// Header carrying the digest of the manifest as the source served it.
pub static MANIFEST_DIGEST: HeaderName = HeaderName::from_static("manifest-digest");

/// Header carrying the digest of the configuration blob.
pub static CONFIG_DIGEST: HeaderName = HeaderName::from_static("config-digest");

const CHUNK_SIZE: usize = 64 * 1024;

/// The proxy's routes.
pub fn router(proxy: ImageProxy) -> Router {
    Router::new()
        .route("/manifest", get(get_manifest))
        .route("/config", get(get_config))
        .route("/blobs/{digest}", get(get_blob))
        .route("/quit", post(quit))
        .fallback(unknown_path)
        .layer(middleware::from_fn(only_get_and_post))
        .with_state(proxy)
}

/// Serve HTTP/1 on one connection until the peer hangs up or asks to quit.
///
/// Quitting lets the in-flight response finish before the connection closes.
#[tracing::instrument(skip_all)]
pub async fn serve_connection<IO>(proxy: ImageProxy, io: IO) -> ProxyResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tracker = SessionTracker::new();
    tracker.advance(SessionState::AwaitingRequest);

    let app = tracked(router(proxy.clone()), tracker.clone(), proxy.clone());
    let service = TowerToHyperService::new(app);
    let shutdown = proxy.shutdown_token();

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let outcome = tokio::select! {
        outcome = conn.as_mut() => outcome,
        _ = shutdown.cancelled() => {
            tracing::trace!("closing connection after quit");
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    tracker.advance(SessionState::ShuttingDown);

    outcome.map_err(|err| {
        tracing::debug!(error = %err, "connection closed with error");
        ProxyError::Io(io::Error::other(err))
    })
}

/// Move `tracker` through the session states around every request on `app`.
pub(crate) fn tracked(app: Router, tracker: SessionTracker, proxy: ImageProxy) -> Router {
    app.layer(middleware::from_fn_with_state(
        (tracker, proxy),
        track_request,
    ))
}

async fn track_request(
    State((tracker, proxy)): State<(SessionTracker, ImageProxy)>,
    request: Request,
    next: Next,
) -> Response {
    tracker.advance(SessionState::Dispatching);
    let response = next.run(request).await;
    tracker.advance(if proxy.is_shutting_down() {
        SessionState::ShuttingDown
    } else {
        SessionState::AwaitingRequest
    });
    response
}

async fn only_get_and_post(request: Request, next: Next) -> Response {
    if allowed(request.method()) {
        next.run(request).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

fn allowed(method: &Method) -> bool {
    method == Method::GET || method == Method::POST
}

async fn get_manifest(State(proxy): State<ImageProxy>) -> ProxyResult<Response> {
    let result = proxy.manifest().await.map_err(|err| failed(&proxy, err))?;
    let digest = digest_header(&result.digest)?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(media_types::OCI_MANIFEST)),
            (MANIFEST_DIGEST.clone(), digest),
        ],
        result.manifest,
    )
        .into_response())
}

async fn get_config(State(proxy): State<ImageProxy>) -> ProxyResult<Response> {
    let (digest, reader, size) = proxy.open_config().await.map_err(|err| failed(&proxy, err))?;

    let mut response = streaming(&proxy, reader, size)
        .await
        .map_err(|err| failed(&proxy, err))?;
    response
        .headers_mut()
        .insert(CONFIG_DIGEST.clone(), digest_header(&digest)?);
    Ok(response)
}

async fn get_blob(
    State(proxy): State<ImageProxy>,
    Path(digest): Path<String>,
) -> ProxyResult<Response> {
    let digest: Digest = digest.parse().map_err(|err| failed(&proxy, err))?;
    let (reader, size) = proxy
        .open_blob(&digest)
        .await
        .map_err(|err| failed(&proxy, err))?;

    streaming(&proxy, reader, size)
        .await
        .map_err(|err| failed(&proxy, err))
}

async fn quit(State(proxy): State<ImageProxy>) -> StatusCode {
    proxy.request_shutdown();
    StatusCode::OK
}

async fn unknown_path(method: Method) -> StatusCode {
    if allowed(&method) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::METHOD_NOT_ALLOWED
    }
}

fn failed(proxy: &ImageProxy, error: ProxyError) -> ProxyError {
    proxy.report(&error);
    error
}

fn digest_header(digest: &Digest) -> ProxyResult<HeaderValue> {
    HeaderValue::from_str(&digest.to_string())
        .map_err(|err| ProxyError::InvalidRequest(err.to_string()))
}

/// Respond with a blob.
///
/// The first chunk is read before any headers are sent. A blob which fits in
/// it is verified up front, so a bad one is still an ordinary `500`.
async fn streaming(
    proxy: &ImageProxy,
    mut reader: VerifiedBlob,
    size: Option<u64>,
) -> ProxyResult<Response> {
    let mut first = BytesMut::with_capacity(CHUNK_SIZE);
    let mut complete = false;
    while first.len() < CHUNK_SIZE {
        if reader.read_buf(&mut first).await? == 0 {
            complete = true;
            break;
        }
    }

    let body = if complete {
        reader.verify()?;
        Body::from(first.freeze())
    } else {
        Body::from_stream(VerifiedBody::new(proxy.clone(), reader, first.freeze()))
    };

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response();
    if let Some(size) = size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

/// A response body which fails at the end if the blob didn't verify.
///
/// There is no way to change the status once bytes have been sent, so the
/// error aborts the connection instead. The last chunk is held back until
/// the digest checks out, so the caller never sees a complete response for
/// a bad blob.
#[pin_project]
struct VerifiedBody {
    #[pin]
    reader: VerifiedBlob,
    buffer: BytesMut,
    held: Option<Bytes>,
    finished: bool,
    proxy: ImageProxy,
}

impl VerifiedBody {
    fn new(proxy: ImageProxy, reader: VerifiedBlob, first: Bytes) -> Self {
        VerifiedBody {
            reader,
            buffer: BytesMut::new(),
            held: Some(first),
            finished: false,
            proxy,
        }
    }
}

impl Stream for VerifiedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        loop {
            if this.buffer.capacity() == 0 {
                this.buffer.reserve(CHUNK_SIZE);
            }

            match ready!(tokio_util::io::poll_read_buf(
                this.reader.as_mut(),
                cx,
                this.buffer
            )) {
                Ok(0) => {
                    *this.finished = true;
                    return match this.reader.verify() {
                        Ok(()) => Poll::Ready(this.held.take().map(Ok)),
                        Err(error) => {
                            this.proxy.report(&error);
                            this.held.take();
                            Poll::Ready(Some(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                error,
                            ))))
                        }
                    };
                }
                Ok(_) => {
                    let chunk = this.buffer.split().freeze();
                    if let Some(previous) = this.held.replace(chunk) {
                        return Poll::Ready(Some(Ok(previous)));
                    }
                }
                Err(error) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}
