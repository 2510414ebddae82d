//! Error types for the registry client
use std::fmt;

use http::StatusCode;
use http_body_util::BodyExt as _;
use thiserror::Error;

use crate::BoxError;

/// An error occured while talking to a registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered with an unexpected status
    #[error(transparent)]
    Response(HttpResponseError),

    /// The requested manifest or blob does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The registry demanded credentials we could not satisfy
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The token endpoint did not hand out a usable token
    #[error("token exchange failed: {0}")]
    Token(String),

    /// An error occured while recieving the response body
    #[error("error reading response body: {0}")]
    ResponseBody(#[source] BoxError),

    /// An error occured while sending the request
    #[error(transparent)]
    Request(hyperdriver::client::Error),

    /// The request could not be constructed
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
}

impl RegistryError {
    /// Whether the registry reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::NotFound(_) => true,
            RegistryError::Response(response) => response.status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }
}

impl From<hyperdriver::client::Error> for RegistryError {
    fn from(error: hyperdriver::client::Error) -> Self {
        RegistryError::Request(error)
    }
}

/// A registry returned an error response
#[derive(Debug, Clone)]
pub struct HttpResponseError {
    /// The HTTP status code of the response
    pub status: StatusCode,

    /// The message body of the response
    pub message: String,
}

impl HttpResponseError {
    /// Create a new HTTP response error from a response, consuming its body.
    pub async fn from_response(response: http::Response<hyperdriver::Body>) -> Self {
        let status = response.status();
        let message = match response.into_body().collect().await {
            Ok(body) => String::from_utf8_lossy(&body.to_bytes()).into_owned(),
            Err(err) => format!("Failed to read response body: {}", err),
        };

        Self { status, message }
    }
}

impl fmt::Display for HttpResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HTTP {} response: {}", self.status, self.message)
    }
}

impl std::error::Error for HttpResponseError {}
