//! Serving an image from an OCI layout directory

use std::path::Path;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt as _;
use image_proxy::{http::router, Digest, ImageName, ImageProxy};
use serde_json::json;
use tower::ServiceExt as _;

fn write_blob(root: &Path, content: &[u8]) -> Digest {
    let digest = Digest::sha256(content);
    let dir = root.join("blobs").join("sha256");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(digest.hex()), content).unwrap();
    digest
}

/// Lay out an image with one layer, tagged `latest`, and return its layer.
fn layout(root: &Path) -> (Digest, Digest) {
    let config = br#"{"architecture":"amd64","os":"linux"}"#;
    let layer = b"layer from disk";
    let config_digest = write_blob(root, config);
    let layer_digest = write_blob(root, layer);

    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest,
            "size": layer.len(),
        }],
    }))
    .unwrap();
    let manifest_digest = write_blob(root, &manifest);

    std::fs::write(root.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
    let index = json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest.len(),
            "annotations": {"org.opencontainers.image.ref.name": "latest"},
        }],
    });
    std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

    (manifest_digest, layer_digest)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_serve_from_layout() {
    let dir = tempfile::tempdir().unwrap();
    let (manifest, layer) = layout(dir.path());

    let name: ImageName = format!("oci:{}:latest", dir.path().display())
        .parse()
        .unwrap();
    let proxy = ImageProxy::builder().image(name).quiet(true).build().unwrap();
    let app = router(proxy);

    let response = app.clone().oneshot(get("/manifest")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["manifest-digest"], manifest.to_string());

    let response = app
        .clone()
        .oneshot(get(&format!("/blobs/{layer}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"layer from disk");

    let response = app
        .oneshot(get(&format!("/blobs/{}", Digest::sha256(b"absent"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_unknown_tag_fails_every_request() {
    let dir = tempfile::tempdir().unwrap();
    layout(dir.path());

    let name: ImageName = format!("oci:{}:nightly", dir.path().display())
        .parse()
        .unwrap();
    let proxy = ImageProxy::builder().image(name).quiet(true).build().unwrap();

    let response = router(proxy).oneshot(get("/manifest")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
