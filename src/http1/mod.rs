pub mod client;
pub mod headers;
pub mod parse;
pub mod server;

use crate::istream::BoxIstream;
use http::{HeaderMap, Method, StatusCode};
use std::net::SocketAddr;

/// A decoded request handed to the top-level handler.
pub struct IncomingRequest {
    pub method: Method,
    /// raw request-target bytes as received
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<BoxIstream>,
    /// the client declared `Expect: 100-continue`
    pub expect_100: bool,
    pub peer_addr: SocketAddr,
    /// negotiated at the listener (TLS or config), not per request
    pub secure: bool,
}

impl IncomingRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A response travelling back towards the client (or returned by the
/// backend client code).
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<BoxIstream>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Option<BoxIstream>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Minimal plain-text error/status response.
    pub fn message(status: StatusCode, msg: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        Self {
            status,
            headers,
            body: Some(crate::istream::from_bytes(msg)),
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    /// response body ends when the connection closes
    UntilClose,
}

/// Statuses that must not carry a body.
pub fn status_has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
