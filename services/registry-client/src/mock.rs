//! A scripted stand-in for the network, for testing registry clients.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use http::response;
use parking_lot::Mutex;

/// One canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
}

impl MockResponse {
    /// Create a canned response.
    pub fn new(status: http::StatusCode, headers: http::HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A `200 OK` with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(http::StatusCode::OK, http::HeaderMap::new(), body)
    }

    /// Add a header to the response.
    pub fn header(mut self, name: http::HeaderName, value: &str) -> Self {
        self.headers.insert(
            name,
            http::HeaderValue::from_str(value).expect("valid header value"),
        );
        self
    }
}

/// A request seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method
    pub method: http::Method,
    /// Full request URI
    pub uri: http::Uri,
    /// Request headers
    pub headers: http::HeaderMap,
}

#[derive(Debug, Default)]
struct MockState {
    responses: HashMap<String, VecDeque<MockResponse>>,
    requests: Vec<RecordedRequest>,
}

/// A tower service answering requests by path.
///
/// Responses registered for a path are handed out in order; the last one
/// repeats once the queue is down to a single entry. Every request is
/// recorded for later inspection.
#[derive(Debug, Default, Clone)]
pub struct MockService {
    state: Arc<Mutex<MockState>>,
}

impl MockService {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a path.
    pub fn add(&self, path: &str, response: MockResponse) {
        self.state
            .lock()
            .responses
            .entry(path.to_owned())
            .or_default()
            .push_back(response);
    }

    /// The requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let (parts, _) = req.into_parts();
        let path = parts.uri.path().to_owned();

        let response = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
            });
            let queue = state
                .responses
                .get_mut(&path)
                .unwrap_or_else(|| panic!("No response configured for path: {path}"));
            if queue.len() > 1 {
                queue.pop_front().expect("queue is not empty")
            } else {
                queue
                    .front()
                    .cloned()
                    .unwrap_or_else(|| panic!("No response configured for path: {path}"))
            }
        };

        let mut builder = response::Builder::new()
            .status(response.status)
            .version(http::Version::HTTP_11);

        for (key, value) in response.headers.iter() {
            builder = builder.header(key, value);
        }

        let response = builder
            .body(hyperdriver::Body::from(response.body))
            .unwrap();

        std::future::ready(Ok(response))
    }
}
