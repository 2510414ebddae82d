//! HTTP sessions over a real socket

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt as _, Empty};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use image_proxy::manifest::media_types;
use image_proxy::{session, Digest, ImageProxy, MemorySource, Protocol, Transport};
use tokio::net::{TcpListener, TcpStream};

const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
const LAYER: &[u8] = b"not really a tarball";

/// A Docker schema 2 image, as a registry would serve it.
fn test_source() -> (MemorySource, Bytes) {
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST,
        "config": {
            "mediaType": media_types::DOCKER_CONFIG,
            "digest": Digest::sha256(CONFIG),
            "size": CONFIG.len(),
        },
        "layers": [{
            "mediaType": media_types::DOCKER_LAYER_GZIP,
            "digest": Digest::sha256(LAYER),
            "size": LAYER.len(),
        }],
    });
    let manifest = Bytes::from(serde_json::to_vec_pretty(&manifest).unwrap());

    let source = MemorySource::new().with_manifest(manifest.clone(), None);
    source.add_blob(Bytes::from_static(CONFIG));
    source.add_blob(Bytes::from_static(LAYER));
    (source, manifest)
}

fn test_proxy(source: MemorySource) -> ImageProxy {
    ImageProxy::builder()
        .source(Arc::new(source))
        .quiet(true)
        .build()
        .unwrap()
}

/// Start a session on one end of a socket pair and connect a client to the other.
async fn connect(
    proxy: ImageProxy,
) -> (
    SendRequest<Empty<Bytes>>,
    tokio::task::JoinHandle<image_proxy::ProxyResult<()>>,
) {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    let session = tokio::spawn(session::run(
        proxy,
        Transport::Fd(OwnedFd::from(theirs)),
        Protocol::Http,
    ));

    ours.set_nonblocking(true).unwrap();
    let stream = tokio::net::UnixStream::from_std(ours).unwrap();
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    (sender, session)
}

fn request(method: Method, uri: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())
        .unwrap()
}

#[tokio::test]
async fn test_requests_on_one_connection() {
    let (source, original) = test_source();
    let (mut client, session) = connect(test_proxy(source)).await;

    let response = client
        .send_request(request(Method::GET, "/manifest"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["manifest-digest"],
        Digest::sha256(&original).to_string()
    );
    let manifest: serde_json::Value =
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes())
            .unwrap();
    assert_eq!(manifest["mediaType"], media_types::OCI_MANIFEST);
    assert_eq!(manifest["layers"][0]["mediaType"], media_types::OCI_LAYER_GZIP);

    let layer = Digest::sha256(LAYER);
    let response = client
        .send_request(request(Method::GET, &format!("/blobs/{layer}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[http::header::CONTENT_LENGTH],
        LAYER.len().to_string()
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], LAYER);

    // Errors don't end the session.
    let response = client
        .send_request(request(Method::GET, "/blobs/sha256:tooshort"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = client
        .send_request(request(Method::GET, "/config"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], CONFIG);

    drop(client);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_quit_ends_the_session() {
    let (source, _) = test_source();
    let proxy = test_proxy(source);
    let (mut client, session) = connect(proxy.clone()).await;

    let response = client
        .send_request(request(Method::POST, "/quit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    session.await.unwrap().unwrap();
    assert!(proxy.is_shutting_down());

    assert!(client
        .send_request(request(Method::GET, "/manifest"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_small_corrupted_blob_keeps_the_session() {
    let source = MemorySource::new();
    let digest = Digest::sha256(b"what the manifest promised");
    source.insert_blob(digest.clone(), Bytes::from_static(b"what the source delivered"));
    let (mut client, session) = connect(test_proxy(source)).await;

    let response = client
        .send_request(request(Method::GET, &format!("/blobs/{digest}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("corrupted blob"));

    let response = client
        .send_request(request(Method::POST, "/quit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    session.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_large_corrupted_blob_aborts_the_connection() {
    let source = MemorySource::new();
    let digest = Digest::sha256(b"what the manifest promised");
    source.insert_blob(digest.clone(), Bytes::from(vec![0x5a; 256 * 1024]));
    let (mut client, session) = connect(test_proxy(source)).await;

    let response = client
        .send_request(request(Method::GET, &format!("/blobs/{digest}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.into_body().collect().await.is_err());

    assert!(session.await.unwrap().is_err());
}

async fn connect_tcp(addr: SocketAddr) -> SendRequest<Empty<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    sender
}

#[tokio::test]
async fn test_listener_serves_many_clients_until_quit() {
    let (source, original) = test_source();
    let proxy = test_proxy(source);

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let session = tokio::spawn({
        let proxy = proxy.clone();
        async move { session::serve_listener(&proxy, listener).await }
    });

    let mut first = connect_tcp(addr).await;
    let mut second = connect_tcp(addr).await;

    for client in [&mut first, &mut second] {
        let response = client
            .send_request(request(Method::GET, "/manifest"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["manifest-digest"],
            Digest::sha256(&original).to_string()
        );
        response.into_body().collect().await.unwrap();
    }

    let response = second
        .send_request(request(Method::POST, "/quit"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    session.await.unwrap().unwrap();
    assert!(proxy.is_shutting_down());
    assert!(TcpStream::connect(addr).await.is_err());
}
