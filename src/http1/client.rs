use super::parse::{parse_response_head, response_body_kind, wants_keep_alive, ParseError};
use super::{headers::strip_hop_headers, BodyKind, HttpResponse};
use crate::istream::{byte_channel, BoxIstream, ByteSender, ChunkedIstream, DechunkParser};
use crate::socket::{FilteredSocket, SocketError};
use bytes::{BufMut, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

/// Request bodies at or above this size (or of unknown size) announce
/// `Expect: 100-continue` before uploading.
const EXPECT_100_THRESHOLD: u64 = 1024;

/// How long to wait for the interim `100 Continue`.
const INTERIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-failure retries of the request wrapper.
pub const HTTP_CLIENT_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("upstream I/O error: {0}")]
    Io(std::io::Error),

    /// The peer sent bytes that cannot be HTTP.
    #[error("garbage response from upstream: {0}")]
    Garbage(&'static str),

    /// Syntactically valid but semantically broken.
    #[error("invalid response from upstream: {0}")]
    Unspecified(&'static str),

    /// Peer closed before the announced end of the response.
    #[error("upstream closed prematurely after {body_received} body bytes")]
    Premature { body_received: u64 },

    #[error("upstream timed out")]
    Timeout,
}

impl HttpClientError {
    /// Whether a fresh connection may be worth another attempt.
    pub fn is_retryable(&self, body_consumed: bool) -> bool {
        match self {
            HttpClientError::Io(_) | HttpClientError::Timeout => !body_consumed,
            HttpClientError::Premature { body_received } => {
                !body_consumed && *body_received == 0
            }
            _ => false,
        }
    }
}

impl From<SocketError> for HttpClientError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::Io(e) => HttpClientError::Io(e),
            SocketError::ReadTimeout | SocketError::WriteTimeout => HttpClientError::Timeout,
            SocketError::Filter(e) => {
                HttpClientError::Io(std::io::Error::other(e.to_string()))
            }
        }
    }
}

impl From<ParseError> for HttpClientError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::Garbage(m) => HttpClientError::Garbage(m),
            ParseError::TooLarge => HttpClientError::Garbage("oversized response head"),
            ParseError::Unspecified(m) => HttpClientError::Unspecified(m),
        }
    }
}

/// A backend connection plus its keep-alive score.
pub struct ClientConnection {
    pub socket: FilteredSocket,
    pub score: i32,
}

impl ClientConnection {
    pub fn new(socket: FilteredSocket) -> Self {
        Self { socket, score: 0 }
    }
}

/// Callback returning the connection to its pool. `reuse == false`
/// discards it.
pub type ReleaseFn = Box<dyn FnOnce(ClientConnection, bool) + Send>;

pub struct ClientRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<BoxIstream>,
}

/// Issue one request on `conn` and parse the response. The response body
/// stream owns the connection via a feeder task; `release` is invoked
/// exactly once when the connection is done (reusable or not).
pub async fn send_request(
    mut conn: ClientConnection,
    request: ClientRequest,
    release: ReleaseFn,
) -> Result<HttpResponse, HttpClientError> {
    let is_head = request.method == Method::HEAD;

    match run_request(&mut conn, request).await {
        Ok(exchange) => deliver_response(conn, exchange, is_head, release),
        Err(e) => {
            release(conn, false);
            Err(e)
        }
    }
}

struct Exchange {
    status: StatusCode,
    headers: HeaderMap,
    http_1_0: bool,
    /// the request body was fully uploaded (or absent)
    upload_complete: bool,
}

async fn run_request(
    conn: &mut ClientConnection,
    request: ClientRequest,
) -> Result<Exchange, HttpClientError> {
    let ClientRequest {
        method,
        uri,
        headers,
        mut body,
    } = request;

    let body_len = body.as_ref().and_then(|b| b.available(false));
    let use_expect =
        body.is_some() && body_len.map_or(true, |n| n >= EXPECT_100_THRESHOLD);
    let body_framing = match (&body, body_len) {
        (None, _) => BodyKind::None,
        (Some(_), Some(n)) => BodyKind::Length(n),
        (Some(_), None) => BodyKind::Chunked,
    };

    let mut head = BytesMut::with_capacity(256);
    head.put_slice(method.as_str().as_bytes());
    head.put_u8(b' ');
    head.put_slice(uri.as_bytes());
    head.put_slice(b" HTTP/1.1\r\n");
    for (name, value) in &headers {
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    match body_framing {
        BodyKind::Length(n) => {
            head.put_slice(b"content-length: ");
            let mut buf = itoa::Buffer::new();
            head.put_slice(buf.format(n).as_bytes());
            head.put_slice(b"\r\n");
        }
        BodyKind::Chunked => head.put_slice(b"transfer-encoding: chunked\r\n"),
        _ => {}
    }
    if use_expect {
        head.put_slice(b"expect: 100-continue\r\n");
    }
    head.put_slice(b"\r\n");
    conn.socket.write_all(&head).await?;

    if use_expect {
        // wait for the interim status before uploading
        let head = read_response_head(&mut conn.socket, Some(INTERIM_TIMEOUT)).await?;
        if head.status != StatusCode::CONTINUE {
            // a final status without the body having been sent
            debug!(
                "client: upstream answered {} before request body",
                head.status
            );
            return Ok(Exchange {
                status: head.status,
                headers: head.headers,
                http_1_0: head.http_1_0,
                upload_complete: false,
            });
        }
        // fall through and upload
    }

    // upload the body while watching for an early final response
    let mut upload_complete = body.is_none();
    if let Some(body) = body.take() {
        let body: BoxIstream = match body_framing {
            BodyKind::Chunked => Box::new(ChunkedIstream::new(body)),
            _ => body,
        };
        upload_complete = upload_body(&mut conn.socket, body).await?;
        if !upload_complete {
            // an early response arrived; its head is already buffered
            trace!("client: upstream responded during upload");
        }
    }

    let head = read_response_head(&mut conn.socket, None).await?;
    if head.status.is_informational() {
        return Err(HttpClientError::Unspecified(
            "unexpected interim response",
        ));
    }
    Ok(Exchange {
        status: head.status,
        headers: head.headers,
        http_1_0: head.http_1_0,
        upload_complete,
    })
}

/// Upload the request body. Returns `false` if the peer produced response
/// bytes before the upload finished (the body upload is then abandoned).
async fn upload_body(
    socket: &mut FilteredSocket,
    mut body: BoxIstream,
) -> Result<bool, HttpClientError> {
    loop {
        match crate::istream::next_chunk(body.as_mut()).await {
            Some(Ok(chunk)) => {
                socket.write_all(&chunk).await?;
                if !socket.buffer().is_empty() {
                    return Ok(false);
                }
            }
            Some(Err(e)) => {
                return Err(HttpClientError::Io(std::io::Error::other(e.to_string())))
            }
            None => return Ok(true),
        }
    }
}

async fn read_response_head(
    socket: &mut FilteredSocket,
    timeout: Option<Duration>,
) -> Result<super::parse::ResponseHead, HttpClientError> {
    loop {
        if !socket.buffer().is_empty() {
            if let Some((head, len)) = parse_response_head(socket.buffer())? {
                socket.consume(len);
                return Ok(head);
            }
        }
        let n = match timeout {
            Some(t) => socket.fill_with_timeout(t).await?,
            None => socket.fill().await?,
        };
        if n == 0 {
            return Err(HttpClientError::Premature { body_received: 0 });
        }
    }
}

/// Build the caller-visible response and hand the connection to a feeder
/// task that decodes the body.
fn deliver_response(
    conn: ClientConnection,
    exchange: Exchange,
    is_head: bool,
    release: ReleaseFn,
) -> Result<HttpResponse, HttpClientError> {
    let Exchange {
        status,
        mut headers,
        http_1_0,
        upload_complete,
    } = exchange;

    let mut peer_keep_alive = wants_keep_alive(http_1_0, &headers) && upload_complete;

    let framing = response_body_kind(status, is_head, &headers, peer_keep_alive)?;
    if framing == BodyKind::UntilClose {
        peer_keep_alive = false;
    }

    strip_hop_headers(&mut headers);

    let body = match framing {
        BodyKind::None => {
            release(
                ClientConnection {
                    score: conn.score + 1,
                    ..conn
                },
                peer_keep_alive,
            );
            None
        }
        _ => {
            let (tx, rx) = byte_channel(64 * 1024);
            if let BodyKind::Length(n) = framing {
                tx.set_total(n);
            }
            tokio::spawn(feed_response_body(
                conn,
                framing,
                tx,
                peer_keep_alive,
                release,
            ));
            Some(Box::new(rx) as BoxIstream)
        }
    };

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Decode the response body off the connection, then release it.
async fn feed_response_body(
    mut conn: ClientConnection,
    framing: BodyKind,
    mut tx: ByteSender,
    keep_alive: bool,
    release: ReleaseFn,
) {
    let reusable = match pump_body(&mut conn.socket, framing, &mut tx).await {
        Ok(()) => {
            tx.close();
            keep_alive
        }
        Err(PumpError::Receiver) => false,
        Err(PumpError::Stream(e)) => {
            tx.fail(e);
            false
        }
    };
    conn.score += if reusable { 1 } else { -5 };
    release(conn, reusable);
}

enum PumpError {
    Receiver,
    Stream(crate::istream::IstreamError),
}

async fn pump_body(
    socket: &mut FilteredSocket,
    framing: BodyKind,
    tx: &mut ByteSender,
) -> Result<(), PumpError> {
    match framing {
        BodyKind::None => Ok(()),
        BodyKind::Length(total) => {
            let mut remaining = total;
            while remaining > 0 {
                if socket.buffer().is_empty() {
                    match socket.fill().await {
                        Ok(0) => {
                            return Err(PumpError::Stream(
                                crate::istream::IstreamError::Premature { remaining },
                            ))
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(PumpError::Stream(
                                crate::istream::IstreamError::Io(std::io::Error::other(
                                    e.to_string(),
                                )),
                            ))
                        }
                    }
                }
                let chunk = socket.take_buffer(remaining.min(usize::MAX as u64) as usize);
                remaining -= chunk.len() as u64;
                tx.send(chunk).await.map_err(|_| PumpError::Receiver)?;
            }
            Ok(())
        }
        BodyKind::Chunked => {
            let mut parser = DechunkParser::new();
            loop {
                if socket.buffer().is_empty() {
                    match socket.fill().await {
                        Ok(0) => {
                            return Err(PumpError::Stream(
                                crate::istream::IstreamError::Chunked(
                                    "connection closed inside chunked body",
                                ),
                            ))
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(PumpError::Stream(
                                crate::istream::IstreamError::Io(std::io::Error::other(
                                    e.to_string(),
                                )),
                            ))
                        }
                    }
                }
                let (event, framing_len) = parser
                    .feed(socket.buffer())
                    .map_err(PumpError::Stream)?;
                socket.consume(framing_len);
                match event {
                    crate::istream::dechunk::DechunkEvent::Data { len } if len > 0 => {
                        let chunk = socket.take_buffer(len);
                        parser.consume_data(chunk.len());
                        tx.send(chunk).await.map_err(|_| PumpError::Receiver)?;
                    }
                    crate::istream::dechunk::DechunkEvent::End => return Ok(()),
                    _ => {}
                }
            }
        }
        BodyKind::UntilClose => loop {
            if socket.buffer().is_empty() {
                match socket.fill().await {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(PumpError::Stream(crate::istream::IstreamError::Io(
                            std::io::Error::other(e.to_string()),
                        )))
                    }
                }
            }
            let chunk = socket.take_buffer(usize::MAX);
            tx.send(chunk).await.map_err(|_| PumpError::Receiver)?;
        },
    }
}

/// Retrying request wrapper: on a retryable failure (connect error,
/// timeout before any response, premature close before any body bytes)
/// it opens a fresh connection and tries again, up to `retries` extra
/// attempts. Requests with a body are never replayed.
pub async fn http_request<C, F>(
    mut connect: C,
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Option<BoxIstream>,
    retries: u32,
) -> Result<HttpResponse, HttpClientError>
where
    C: FnMut() -> F,
    F: Future<Output = Result<(ClientConnection, ReleaseFn), HttpClientError>>,
{
    let mut body = body;
    let mut attempt = 0;
    loop {
        let (conn, release) = match connect().await {
            Ok(c) => c,
            Err(e) if attempt < retries && body.is_none() => {
                debug!("client: connect failed (attempt {}): {}", attempt + 1, e);
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let request = ClientRequest {
            method: method.clone(),
            uri: uri.clone(),
            headers: headers.clone(),
            body: body.take(),
        };
        let had_body = request.body.is_some();

        match send_request(conn, request, release).await {
            Ok(response) => return Ok(response),
            Err(e) if !had_body && attempt < retries && e.is_retryable(false) => {
                debug!("client: retrying after error (attempt {}): {}", attempt + 1, e);
                metrics::counter!("proxy_client_retries_total").increment(1);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(HttpClientError::Premature { body_received: 0 }.is_retryable(false));
        assert!(!HttpClientError::Premature { body_received: 9 }.is_retryable(false));
        assert!(!HttpClientError::Premature { body_received: 0 }.is_retryable(true));
        assert!(!HttpClientError::Garbage("x").is_retryable(false));
        assert!(HttpClientError::Timeout.is_retryable(false));
    }
}
