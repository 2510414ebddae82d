//! Registry authentication.
//!
//! Registries announce how they want to be authenticated with a
//! `WWW-Authenticate` challenge on a `401` response. Two schemes are
//! understood:
//! - `Basic`, answered directly with the configured credentials
//! - `Bearer`, answered by exchanging (possibly anonymous) credentials for a
//!   token at the advertised realm
//!
//! The resulting `Authorization` header is remembered and attached to every
//! later request.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use http::HeaderValue;

/// Create a basic authentication header value.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
///
/// # Example
/// ```rust
/// use registry_client::basic_auth;
///
/// let header = basic_auth("username", "password");
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(username: U, password: P) -> HeaderValue
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:{}", username, password);
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Username and password for a registry.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse credentials written as `username:password`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (username, password) = raw.split_once(':')?;
        if username.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn header_value(&self) -> HeaderValue {
        basic_auth(&self.username, &self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// `Basic realm="..."`
    Basic,

    /// `Bearer realm="...",service="...",scope="..."`
    Bearer {
        /// Token endpoint
        realm: String,
        /// Service the token is for
        service: Option<String>,
        /// Requested access scope
        scope: Option<String>,
    },
}

impl Challenge {
    /// Parse a challenge header value. Unknown schemes yield `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let realm = param(params, "realm")?;
        Some(Challenge::Bearer {
            realm,
            service: param(params, "service"),
            scope: param(params, "scope"),
        })
    }
}

/// Extract `name="value"` from a challenge parameter list.
fn param(params: &str, name: &str) -> Option<String> {
    let search = format!("{name}=\"");
    let mut rest = params;
    while let Some(start) = rest.find(&search) {
        let preceding = rest[..start].chars().next_back();
        let value_start = start + search.len();
        if matches!(preceding, None | Some(',') | Some(' ')) {
            let end = rest[value_start..].find('"')?;
            return Some(rest[value_start..value_start + end].to_owned());
        }
        rest = &rest[value_start..];
    }
    None
}

/// The `Authorization` header currently in use for a registry.
///
/// Shared between clones of a client, so a token negotiated by one request
/// is reused by the rest.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegistryAuth {
    header: Arc<ArcSwapOption<HeaderValue>>,
}

impl RegistryAuth {
    pub(crate) fn store(&self, mut value: HeaderValue) {
        value.set_sensitive(true);
        self.header.store(Some(Arc::new(value)));
    }

    pub(crate) fn bearer(&self, token: &str) -> Result<(), http::header::InvalidHeaderValue> {
        let value = HeaderValue::try_from(format!("Bearer {token}"))?;
        self.store(value);
        Ok(())
    }

    pub(crate) fn is_set(&self) -> bool {
        self.header.load().is_some()
    }

    pub(crate) fn authenticate<B>(&self, mut req: http::Request<B>) -> http::Request<B> {
        if let Some(value) = self.header.load_full() {
            if !req.headers().contains_key(http::header::AUTHORIZATION) {
                req.headers_mut()
                    .insert(http::header::AUTHORIZATION, (*value).clone());
            } else {
                tracing::warn!("{} header already set", http::header::AUTHORIZATION);
            }
        }
        req
    }
}
