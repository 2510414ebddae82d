//! # OCI Distribution client
//!
//! A small pull-only client for the
//! [OCI Distribution API](https://github.com/opencontainers/distribution-spec):
//! fetch manifests with content negotiation, and stream blobs without
//! buffering them.
//!
//! Authentication follows the registry's `WWW-Authenticate` challenge, which
//! covers anonymous bearer tokens (Docker Hub, quay.io, ghcr.io) as well as
//! basic-auth protected registries.
//!
//! ```no_run
//! use registry_client::{ImageReference, RegistryClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let reference: ImageReference = "quay.io/fedora/fedora:latest".parse()?;
//! let client = RegistryClient::new(reference);
//! let manifest = client.manifest(None).await?;
//! println!("{} bytes of {:?}", manifest.bytes.len(), manifest.media_type);
//! # Ok(())
//! # }
//! ```

use std::io;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt as _, TryStreamExt as _};
use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, USER_AGENT, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::service::SharedService;
use tower::ServiceExt as _;

mod authentication;
mod error;
pub mod mock;
mod reference;

pub use self::authentication::{basic_auth, Challenge, Credentials};
use self::authentication::RegistryAuth;
pub use self::error::{HttpResponseError, RegistryError};
pub use self::reference::{ImageReference, ReferenceError, DEFAULT_REGISTRY};

/// Boxed error type used for transport-level failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A stream of blob bytes, in order.
pub type BlobStream = BoxStream<'static, io::Result<Bytes>>;

/// Media types accepted when asking for a manifest, most preferred first.
pub const MANIFEST_ACCEPT: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
    "application/vnd.docker.distribution.manifest.v1+json",
];

const MAX_REDIRECTS: usize = 5;

/// A manifest as served by the registry.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The raw manifest document
    pub bytes: Bytes,

    /// The `Content-Type` the registry declared, if any
    pub media_type: Option<String>,
}

/// A blob download in progress.
pub struct Blob {
    /// The blob contents
    pub stream: BlobStream,

    /// The size advertised by the registry, if it sent one
    pub size: Option<u64>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob").field("size", &self.size).finish()
    }
}

/// A client for pulling one repository from a registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    reference: ImageReference,
    base: String,
    inner: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    credentials: Option<Credentials>,
    auth: RegistryAuth,
    user_agent: HeaderValue,
}

impl RegistryClient {
    /// Create a client talking to the registry named by `reference`.
    pub fn new(reference: ImageReference) -> Self {
        let inner = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();

        Self::with_service(reference, inner)
    }

    /// Create a client using a custom inner service in place of the network.
    pub fn new_with_inner_service<S>(reference: ImageReference, inner: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(inner);

        Self::with_service(reference, service)
    }

    fn with_service(
        reference: ImageReference,
        inner: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    ) -> Self {
        let base = format!("{}://{}", reference.scheme(), reference.endpoint());

        RegistryClient {
            reference,
            base,
            inner,
            credentials: None,
            auth: RegistryAuth::default(),
            user_agent: HeaderValue::from_static(concat!(
                "registry-client/",
                env!("CARGO_PKG_VERSION")
            )),
        }
    }

    /// Use credentials when the registry asks for them.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the `User-Agent` sent with every request.
    pub fn with_user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// The reference this client pulls from.
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Check that the registry is reachable, negotiating authentication if required.
    #[tracing::instrument(skip(self), fields(registry = %self.reference.registry()))]
    pub async fn ping(&self) -> Result<(), RegistryError> {
        let response = self.get("/v2/", None).await?;
        if !response.status().is_success() {
            return Err(RegistryError::Response(
                HttpResponseError::from_response(response).await,
            ));
        }
        tracing::debug!("registry is reachable");
        Ok(())
    }

    /// Fetch a manifest, by default the one the reference names.
    ///
    /// Pass a digest to fetch a specific instance, e.g. an entry of an image index.
    #[tracing::instrument(skip(self), fields(repository = %self.reference.repository()))]
    pub async fn manifest(&self, instance: Option<&str>) -> Result<Manifest, RegistryError> {
        let reference = instance.unwrap_or_else(|| self.reference.reference());
        let path = format!(
            "/v2/{}/manifests/{}",
            self.reference.repository(),
            reference
        );

        let response = self.get(&path, Some(&MANIFEST_ACCEPT.join(", "))).await?;
        let response = check_status(response, || format!("manifest {reference}")).await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned());

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| RegistryError::ResponseBody(err.into()))?
            .to_bytes();

        tracing::trace!(size = bytes.len(), ?media_type, "fetched manifest");
        Ok(Manifest { bytes, media_type })
    }

    /// Start downloading a blob.
    ///
    /// Redirects to external storage are followed without the registry's credentials.
    #[tracing::instrument(skip(self), fields(repository = %self.reference.repository()))]
    pub async fn blob(&self, digest: &str) -> Result<Blob, RegistryError> {
        let path = format!("/v2/{}/blobs/{}", self.reference.repository(), digest);
        let mut response = self.get(&path, None).await?;

        let mut redirects = 0;
        while response.status().is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    RegistryError::Response(HttpResponseError {
                        status: response.status(),
                        message: "redirect without a location".into(),
                    })
                })?;

            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(RegistryError::Response(HttpResponseError {
                    status: response.status(),
                    message: "too many redirects".into(),
                }));
            }

            let uri = self.resolve(location)?;
            tracing::trace!(%uri, "following blob redirect");
            let request = http::Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(USER_AGENT, self.user_agent.clone())
                .body(hyperdriver::Body::empty())?;
            response = self.execute(request).await?;
        }

        let response = check_status(response, || format!("blob {digest}")).await?;

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let stream = response
            .into_body()
            .into_data_stream()
            .map_err(io::Error::other)
            .boxed();

        Ok(Blob { stream, size })
    }

    fn resolve(&self, location: &str) -> Result<Uri, RegistryError> {
        let uri = if location.starts_with('/') {
            format!("{}{}", self.base, location)
        } else {
            location.to_owned()
        };
        uri.parse::<Uri>()
            .map_err(|err| RegistryError::InvalidRequest(err.into()))
    }

    fn request(&self, uri: &Uri, accept: Option<&str>) -> Result<http::Request<hyperdriver::Body>, RegistryError> {
        let mut builder = http::Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        let request = builder.body(hyperdriver::Body::empty())?;
        Ok(self.auth.authenticate(request))
    }

    /// GET a registry endpoint, answering one authentication challenge if needed.
    async fn get(
        &self,
        path: &str,
        accept: Option<&str>,
    ) -> Result<http::Response<hyperdriver::Body>, RegistryError> {
        let uri = self.resolve(path)?;
        tracing::trace!("GET {}", uri);

        let response = self.execute(self.request(&uri, accept)?).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| {
                RegistryError::Unauthorized(format!(
                    "{} sent no usable authentication challenge",
                    self.reference.registry()
                ))
            })?;

        self.authorize(&challenge).await?;
        self.execute(self.request(&uri, accept)?).await
    }

    async fn authorize(&self, challenge: &Challenge) -> Result<(), RegistryError> {
        match challenge {
            Challenge::Basic => {
                let credentials = self.credentials.as_ref().ok_or_else(|| {
                    RegistryError::Unauthorized(format!(
                        "{} requires credentials",
                        self.reference.registry()
                    ))
                })?;
                self.auth.store(credentials.header_value());
                Ok(())
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = scope
                    .clone()
                    .unwrap_or_else(|| format!("repository:{}:pull", self.reference.repository()));
                let token = self.fetch_token(realm, service.as_deref(), &scope).await?;
                self.auth
                    .bearer(&token)
                    .map_err(|err| RegistryError::Token(err.to_string()))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String, RegistryError> {
        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let query = serde_urlencoded::to_string(&query)
            .map_err(|err| RegistryError::Token(err.to_string()))?;
        let separator = if realm.contains('?') { '&' } else { '?' };
        let uri = format!("{realm}{separator}{query}")
            .parse::<Uri>()
            .map_err(|err| RegistryError::InvalidRequest(err.into()))?;

        let mut builder = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(credentials) = &self.credentials {
            builder = builder.header(http::header::AUTHORIZATION, credentials.header_value());
        }
        let request = builder.body(hyperdriver::Body::empty())?;

        let response = self.execute(request).await?;
        if !response.status().is_success() {
            let error = HttpResponseError::from_response(response).await;
            return Err(RegistryError::Token(error.to_string()));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| RegistryError::ResponseBody(err.into()))?
            .to_bytes();

        let token: TokenResponse =
            serde_json::from_slice(&body).map_err(|err| RegistryError::Token(err.to_string()))?;
        tracing::debug!("obtained registry token");
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Token("response contained no token".into()))
    }

    async fn execute(
        &self,
        request: http::Request<hyperdriver::Body>,
    ) -> Result<http::Response<hyperdriver::Body>, RegistryError> {
        Ok(self.inner.clone().oneshot(request).await?)
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

async fn check_status<F>(
    response: http::Response<hyperdriver::Body>,
    what: F,
) -> Result<http::Response<hyperdriver::Body>, RegistryError>
where
    F: FnOnce() -> String,
{
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::NOT_FOUND {
        Err(RegistryError::NotFound(what()))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let error = HttpResponseError::from_response(response).await;
        Err(RegistryError::Unauthorized(error.to_string()))
    } else {
        Err(RegistryError::Response(
            HttpResponseError::from_response(response).await,
        ))
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt as _;

    use super::*;
    use crate::mock::{MockResponse, MockService};

    fn client(mock: &MockService) -> RegistryClient {
        let reference = ImageReference::parse("registry.test/app/server:1.0").unwrap();
        RegistryClient::new_with_inner_service(reference, mock.clone())
    }

    #[test]
    fn extensions_produce_send_futures() {
        let mock = MockService::new();
        let client = client(&mock);

        fn assert_send<T: Send>(_t: T) {}

        assert_send(client.manifest(None));
        assert_send(client.blob("sha256:abcd"));
    }

    #[tokio::test]
    async fn manifest_with_anonymous_token() {
        let mock = MockService::new();
        mock.add(
            "/v2/app/server/manifests/1.0",
            MockResponse::new(StatusCode::UNAUTHORIZED, http::HeaderMap::new(), "").header(
                WWW_AUTHENTICATE,
                r#"Bearer realm="https://auth.registry.test/token",service="registry.test""#,
            ),
        );
        mock.add(
            "/v2/app/server/manifests/1.0",
            MockResponse::ok(r#"{"schemaVersion":2}"#).header(
                CONTENT_TYPE,
                "application/vnd.oci.image.manifest.v1+json; charset=utf-8",
            ),
        );
        mock.add("/token", MockResponse::ok(r#"{"token":"t0ken"}"#));

        let client = client(&mock);
        let manifest = client.manifest(None).await.unwrap();
        assert_eq!(&manifest.bytes[..], br#"{"schemaVersion":2}"#);
        assert_eq!(
            manifest.media_type.as_deref(),
            Some("application/vnd.oci.image.manifest.v1+json")
        );

        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        let token_query = requests[1].uri.query().unwrap();
        assert!(token_query.contains("scope=repository%3Aapp%2Fserver%3Apull"));
        assert!(token_query.contains("service=registry.test"));
        assert_eq!(
            requests[2].headers[http::header::AUTHORIZATION],
            "Bearer t0ken"
        );
    }

    #[tokio::test]
    async fn basic_challenge_without_credentials_is_unauthorized() {
        let mock = MockService::new();
        mock.add(
            "/v2/",
            MockResponse::new(StatusCode::UNAUTHORIZED, http::HeaderMap::new(), "")
                .header(WWW_AUTHENTICATE, r#"Basic realm="registry""#),
        );

        let err = client(&mock).ping().await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn basic_challenge_uses_credentials() {
        let mock = MockService::new();
        mock.add(
            "/v2/",
            MockResponse::new(StatusCode::UNAUTHORIZED, http::HeaderMap::new(), "")
                .header(WWW_AUTHENTICATE, r#"Basic realm="registry""#),
        );
        mock.add("/v2/", MockResponse::ok("{}"));

        let client = client(&mock).with_credentials(Credentials::new("user", "pass"));
        client.ping().await.unwrap();
        assert_eq!(
            mock.requests()[1].headers[http::header::AUTHORIZATION],
            basic_auth("user", "pass")
        );
    }

    #[tokio::test]
    async fn blob_streams_and_reports_size() {
        let mock = MockService::new();
        mock.add(
            "/v2/app/server/blobs/sha256:abcd",
            MockResponse::new(StatusCode::TEMPORARY_REDIRECT, http::HeaderMap::new(), "")
                .header(LOCATION, "/storage/abcd"),
        );
        mock.add(
            "/storage/abcd",
            MockResponse::ok("layer bytes").header(CONTENT_LENGTH, "11"),
        );

        let blob = client(&mock).blob("sha256:abcd").await.unwrap();
        assert_eq!(blob.size, Some(11));

        let chunks: Vec<Bytes> = blob.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"layer bytes");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let mock = MockService::new();
        mock.add(
            "/v2/app/server/blobs/sha256:ffff",
            MockResponse::new(StatusCode::NOT_FOUND, http::HeaderMap::new(), "{}"),
        );

        let err = client(&mock).blob("sha256:ffff").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
