use super::BodyKind;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

/// Upper bound on the request/status line plus all header lines.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Peer sent bytes that are not HTTP.
    #[error("malformed HTTP head: {0}")]
    Garbage(&'static str),
    /// Valid syntax, impossible semantics.
    #[error("invalid HTTP message: {0}")]
    Unspecified(&'static str),
    #[error("HTTP head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,
}

pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub http_1_0: bool,
}

pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub http_1_0: bool,
}

/// Parse a request head from the start of `input`. Returns the head and
/// the number of bytes it occupied, or `None` while incomplete.
pub fn parse_request_head(input: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(input) {
        Ok(httparse::Status::Complete(len)) => {
            let method = req
                .method
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .ok_or(ParseError::Garbage("bad method"))?;
            let uri = req.path.ok_or(ParseError::Garbage("missing URI"))?;
            let http_1_0 = req.version == Some(0);
            let headers = convert_headers(req.headers)?;
            Ok(Some((
                RequestHead {
                    method,
                    uri: uri.to_string(),
                    headers,
                    http_1_0,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if input.len() >= MAX_HEAD_SIZE {
                Err(ParseError::TooLarge)
            } else {
                Ok(None)
            }
        }
        Err(httparse::Error::TooManyHeaders) => Err(ParseError::TooLarge),
        Err(_) => Err(ParseError::Garbage("unparseable request head")),
    }
}

/// Parse a status line + headers from upstream.
pub fn parse_response_head(input: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(input) {
        Ok(httparse::Status::Complete(len)) => {
            let status = resp
                .code
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or(ParseError::Garbage("bad status code"))?;
            let http_1_0 = resp.version == Some(0);
            let headers = convert_headers(resp.headers)?;
            Ok(Some((
                ResponseHead {
                    status,
                    headers,
                    http_1_0,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => {
            if input.len() >= MAX_HEAD_SIZE {
                Err(ParseError::TooLarge)
            } else {
                Ok(None)
            }
        }
        Err(httparse::Error::TooManyHeaders) => Err(ParseError::TooLarge),
        Err(_) => Err(ParseError::Garbage("unparseable status line")),
    }
}

fn convert_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ParseError::Garbage("bad header name"))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| ParseError::Garbage("bad header value"))?;
        // append preserves duplicates in order
        headers.append(name, value);
    }
    Ok(headers)
}

/// Decide how a request body is framed.
pub fn request_body_kind(method: &Method, headers: &HeaderMap) -> Result<BodyKind, ParseError> {
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    if let Some(cl) = headers.get(CONTENT_LENGTH) {
        let n: u64 = cl
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(ParseError::Unspecified("invalid Content-Length"))?;
        return Ok(if n == 0 { BodyKind::None } else { BodyKind::Length(n) });
    }
    // TRACE must not carry a body; everything else simply has none
    let _ = method;
    Ok(BodyKind::None)
}

/// Decide how a response body is framed.
pub fn response_body_kind(
    status: StatusCode,
    request_was_head: bool,
    headers: &HeaderMap,
    keep_alive: bool,
) -> Result<BodyKind, ParseError> {
    if request_was_head || super::status_has_no_body(status) {
        return Ok(BodyKind::None);
    }
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    if let Some(cl) = headers.get(CONTENT_LENGTH) {
        let n: u64 = cl
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(ParseError::Unspecified("invalid Content-Length"))?;
        return Ok(if n == 0 { BodyKind::None } else { BodyKind::Length(n) });
    }
    if keep_alive {
        // a keep-alive response without explicit framing has no body
        Ok(BodyKind::None)
    } else {
        Ok(BodyKind::UntilClose)
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Did the peer ask for the connection to stay open?
pub fn wants_keep_alive(http_1_0: bool, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok());
    match connection {
        Some(v) if token_list_contains(v, "close") => false,
        Some(v) if token_list_contains(v, "keep-alive") => true,
        // HTTP/1.0 defaults to close unless explicitly negotiated
        _ => !http_1_0,
    }
}

fn token_list_contains(list: &str, token: &str) -> bool {
    list.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_duplicate_headers() {
        let input = b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\nX-Dup: 1\r\nX-Dup: 2\r\n\r\nrest";
        let (head, len) = parse_request_head(input).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri, "/a?x=1");
        assert!(!head.http_1_0);
        assert_eq!(&input[len..], b"rest");
        let dups: Vec<_> = head.headers.get_all("x-dup").iter().collect();
        assert_eq!(dups.len(), 2);
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_request_head(b"\x00\x01\x02\r\n\r\n"),
            Err(ParseError::Garbage(_))
        ));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        assert!(matches!(
            parse_request_head(&input),
            Err(ParseError::TooLarge)
        ));
    }

    #[test]
    fn response_status_line() {
        let input = b"HTTP/1.0 204 No Content\r\n\r\n";
        let (head, _) = parse_response_head(input).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
        assert!(head.http_1_0);
    }

    #[test]
    fn body_framing_rules() {
        let mut h = HeaderMap::new();
        assert_eq!(
            request_body_kind(&Method::GET, &h).unwrap(),
            BodyKind::None
        );

        h.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(
            request_body_kind(&Method::POST, &h).unwrap(),
            BodyKind::Length(42)
        );

        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert_eq!(
            request_body_kind(&Method::POST, &h).unwrap(),
            BodyKind::Chunked
        );
    }

    #[test]
    fn response_until_close_without_framing() {
        let h = HeaderMap::new();
        assert_eq!(
            response_body_kind(StatusCode::OK, false, &h, false).unwrap(),
            BodyKind::UntilClose
        );
        assert_eq!(
            response_body_kind(StatusCode::NOT_MODIFIED, false, &h, false).unwrap(),
            BodyKind::None
        );
        assert_eq!(
            response_body_kind(StatusCode::OK, true, &h, false).unwrap(),
            BodyKind::None
        );
    }

    #[test]
    fn keep_alive_defaults() {
        let h = HeaderMap::new();
        assert!(wants_keep_alive(false, &h));
        assert!(!wants_keep_alive(true, &h));

        let mut h = HeaderMap::new();
        h.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        assert!(wants_keep_alive(true, &h));

        let mut h = HeaderMap::new();
        h.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!wants_keep_alive(false, &h));
    }
}
