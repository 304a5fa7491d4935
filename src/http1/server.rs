use super::parse::{
    parse_request_head, request_body_kind, wants_keep_alive, ParseError, RequestHead,
};
use super::{BodyKind, HttpResponse, IncomingRequest};
use crate::istream::{byte_channel, BoxIstream, ByteSender, ChunkedIstream, DechunkParser};
use crate::socket::{FilteredSocket, SocketError};
use bytes::{BufMut, BytesMut};
use http::{HeaderMap, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Per-request byte budget for the body conduit between the connection
/// task and the handler.
const BODY_CHANNEL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ServerTimeouts {
    /// waiting for the first byte of the next request
    pub idle: Duration,
    /// from the first head byte until the blank line
    pub header: Duration,
    /// between request-body reads
    pub read: Duration,
    pub write: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            header: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// The application side of a server connection.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        request: IncomingRequest,
    ) -> Pin<Box<dyn Future<Output = HttpResponse> + Send + '_>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(IncomingRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn handle(
        &self,
        request: IncomingRequest,
    ) -> Pin<Box<dyn Future<Output = HttpResponse> + Send + '_>> {
        Box::pin(self(request))
    }
}

/// Integer health of a connection, fed back into pooling decisions.
/// Completed request/response cycles raise it, protocol violations and
/// timeouts lower it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionScore(pub i32);

impl ConnectionScore {
    fn success(&mut self) {
        self.0 += 1;
    }

    fn failure(&mut self) {
        self.0 -= 5;
    }
}

enum FeedOutcome {
    /// body fully decoded and pushed to the handler
    Complete,
    /// handler dropped the body stream before the end
    ReceiverGone,
    Error(SocketError),
    Protocol(&'static str),
}

/// Serve HTTP/1.1 requests on `socket` until the connection closes.
/// Returns the final keep-alive score.
pub async fn serve_connection<H: RequestHandler>(
    mut socket: FilteredSocket,
    peer_addr: SocketAddr,
    secure: bool,
    handler: Arc<H>,
    timeouts: ServerTimeouts,
) -> i32 {
    let mut score = ConnectionScore::default();
    socket.set_write_timeout(timeouts.write);

    loop {
        let head = match read_head(&mut socket, &timeouts).await {
            Ok(Some(head)) => head,
            Ok(None) => break, // orderly close between requests
            Err(HeadError::Parse(e)) => {
                debug!("server: rejecting malformed request: {}", e);
                let _ = write_simple_response(
                    &mut socket,
                    StatusCode::BAD_REQUEST,
                    "malformed request\n",
                )
                .await;
                score.failure();
                break;
            }
            Err(HeadError::Socket(e)) => {
                trace!("server: closing connection: {}", e);
                score.failure();
                break;
            }
        };

        let http_1_0 = head.http_1_0;
        let request_keep_alive = wants_keep_alive(http_1_0, &head.headers);
        let is_head_request = head.method == http::Method::HEAD;

        // Expect handling: only 100-continue is understood
        let expect_100 = match head.headers.get(http::header::EXPECT) {
            None => false,
            Some(v) if v.as_bytes().eq_ignore_ascii_case(b"100-continue") => true,
            Some(_) => {
                let _ = write_simple_response(
                    &mut socket,
                    StatusCode::EXPECTATION_FAILED,
                    "unsupported expectation\n",
                )
                .await;
                score.failure();
                break;
            }
        };

        let body_kind = match request_body_kind(&head.method, &head.headers) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("server: bad body framing: {}", e);
                let _ =
                    write_simple_response(&mut socket, StatusCode::BAD_REQUEST, "bad framing\n")
                        .await;
                score.failure();
                break;
            }
        };

        let has_body = body_kind != BodyKind::None || expect_100;
        let (body_tx, body) = if has_body {
            let (tx, rx) = byte_channel(BODY_CHANNEL_CAPACITY);
            if let BodyKind::Length(n) = body_kind {
                tx.set_total(n);
            }
            if body_kind == BodyKind::None {
                tx.set_total(0);
            }
            (Some(tx), Some(Box::new(rx) as BoxIstream))
        } else {
            (None, None)
        };

        let request = IncomingRequest {
            method: head.method.clone(),
            uri: head.uri,
            headers: head.headers,
            body,
            expect_100,
            peer_addr,
            secure,
        };

        metrics::counter!("proxy_http_requests_total").increment(1);

        // drive the handler and the body feed concurrently on this task
        let mut handler_fut = handler.handle(request);
        let mut feed_outcome: Option<FeedOutcome> = None;
        let mut continue_sent = false;
        let mut body_remaining = match body_kind {
            BodyKind::Length(n) => n,
            BodyKind::None => 0,
            _ => u64::MAX,
        };
        let response = {
            let feed = feed_body(
                body_tx,
                body_kind,
                expect_100,
                timeouts.read,
                &mut socket,
                &mut continue_sent,
                &mut body_remaining,
            );
            tokio::pin!(feed);
            loop {
                tokio::select! {
                    r = handler_fut.as_mut() => break r,
                    outcome = feed.as_mut(), if feed_outcome.is_none() => {
                        feed_outcome = Some(outcome);
                    }
                }
            }
        };

        // the handler has produced a response; settle the request body
        let mut keep_alive = request_keep_alive;
        match settle_body(
            feed_outcome,
            body_kind,
            expect_100,
            continue_sent,
            body_remaining,
            &mut socket,
        ) {
            BodySettle::Clean => {}
            BodySettle::Dirty => keep_alive = false,
            BodySettle::Fatal => {
                score.failure();
                break;
            }
        }

        match write_response(
            &mut socket,
            response,
            is_head_request,
            http_1_0,
            &mut keep_alive,
        )
        .await
        {
            Ok(()) => {}
            Err(e) => {
                trace!("server: response write failed: {}", e);
                score.failure();
                break;
            }
        }

        if socket.peer_closed() || socket.saw_hangup() {
            keep_alive = false;
        }

        score.success();

        if !keep_alive || !socket.is_drained() {
            break;
        }
    }

    score.0
}

enum HeadError {
    Parse(ParseError),
    Socket(SocketError),
}

/// Wait for and parse the next request head. `Ok(None)` means the peer
/// closed the connection cleanly between requests.
async fn read_head(
    socket: &mut FilteredSocket,
    timeouts: &ServerTimeouts,
) -> Result<Option<RequestHead>, HeadError> {
    loop {
        if !socket.buffer().is_empty() {
            match parse_request_head(socket.buffer()).map_err(HeadError::Parse)? {
                Some((head, len)) => {
                    socket.consume(len);
                    return Ok(Some(head));
                }
                None => {}
            }
        }
        let timeout = if socket.buffer().is_empty() {
            timeouts.idle
        } else {
            timeouts.header
        };
        let n = socket
            .fill_with_timeout(timeout)
            .await
            .map_err(HeadError::Socket)?;
        if n == 0 {
            return if socket.buffer().is_empty() {
                Ok(None)
            } else {
                Err(HeadError::Parse(ParseError::Garbage(
                    "connection closed inside request head",
                )))
            };
        }
    }
}

enum BodySettle {
    /// body fully consumed (or provably absent); keep-alive is fine
    Clean,
    /// undrained body bytes remain on the wire; connection must close
    Dirty,
    /// the socket is broken
    Fatal,
}

/// Decode the request body off the socket into the handler's stream.
async fn feed_body(
    tx: Option<ByteSender>,
    kind: BodyKind,
    expect_100: bool,
    read_timeout: Duration,
    socket: &mut FilteredSocket,
    continue_sent: &mut bool,
    remaining_out: &mut u64,
) -> FeedOutcome {
    let Some(mut tx) = tx else {
        return FeedOutcome::Complete;
    };

    if expect_100 {
        // the interim response is only sent once the handler starts
        // reading the body
        if tx.wait_pull_started().await.is_err() {
            return FeedOutcome::ReceiverGone;
        }
        if let Err(e) = socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await {
            return FeedOutcome::Error(e);
        }
        *continue_sent = true;
    }

    match kind {
        BodyKind::None => {
            tx.close();
            FeedOutcome::Complete
        }
        BodyKind::Length(total) => {
            let mut remaining = total;
            while remaining > 0 {
                if socket.buffer().is_empty() {
                    match socket.fill_with_timeout(read_timeout).await {
                        Ok(0) => {
                            tx.fail(crate::istream::IstreamError::Premature { remaining });
                            return FeedOutcome::Protocol("body truncated");
                        }
                        Ok(_) => {}
                        Err(e) => return FeedOutcome::Error(e),
                    }
                }
                let chunk = socket.take_buffer(remaining.min(usize::MAX as u64) as usize);
                remaining -= chunk.len() as u64;
                *remaining_out = remaining;
                if tx.send(chunk).await.is_err() {
                    return FeedOutcome::ReceiverGone;
                }
            }
            tx.close();
            FeedOutcome::Complete
        }
        BodyKind::Chunked => {
            let mut parser = DechunkParser::new();
            loop {
                if socket.buffer().is_empty() {
                    match socket.fill_with_timeout(read_timeout).await {
                        Ok(0) => {
                            tx.fail(crate::istream::IstreamError::Chunked(
                                "connection closed inside chunked body",
                            ));
                            return FeedOutcome::Protocol("chunked body truncated");
                        }
                        Ok(_) => {}
                        Err(e) => return FeedOutcome::Error(e),
                    }
                }
                let (event, framing) = match parser.feed(socket.buffer()) {
                    Ok(r) => r,
                    Err(e) => {
                        tx.fail(e);
                        return FeedOutcome::Protocol("malformed chunked body");
                    }
                };
                socket.consume(framing);
                match event {
                    crate::istream::dechunk::DechunkEvent::Data { len } if len > 0 => {
                        let chunk = socket.take_buffer(len);
                        parser.consume_data(chunk.len());
                        if tx.send(chunk).await.is_err() {
                            return FeedOutcome::ReceiverGone;
                        }
                    }
                    crate::istream::dechunk::DechunkEvent::End => {
                        tx.close();
                        return FeedOutcome::Complete;
                    }
                    _ => {}
                }
            }
        }
        BodyKind::UntilClose => unreachable!("requests are never close-delimited"),
    }
}

/// After the handler responded: bring the connection into a state where
/// the next request can start, or declare it unusable.
fn settle_body(
    outcome: Option<FeedOutcome>,
    kind: BodyKind,
    expect_100: bool,
    continue_sent: bool,
    remaining: u64,
    socket: &mut FilteredSocket,
) -> BodySettle {
    match outcome {
        Some(FeedOutcome::Complete) => BodySettle::Clean,
        Some(FeedOutcome::Error(_)) | Some(FeedOutcome::Protocol(_)) => BodySettle::Fatal,
        Some(FeedOutcome::ReceiverGone) | None => {
            // handler finished without draining the body
            if expect_100 && !continue_sent {
                // the client is still waiting for our 100: the body was
                // never sent, so there is nothing to discard, but the
                // exchange is out of step and the connection closes
                return BodySettle::Dirty;
            }
            match kind {
                BodyKind::None => BodySettle::Clean,
                BodyKind::Length(_) => {
                    // cheap salvage: the undelivered remainder may
                    // already sit in the read buffer
                    if socket.buffer().len() as u64 >= remaining {
                        socket.consume(remaining as usize);
                        BodySettle::Clean
                    } else {
                        BodySettle::Dirty
                    }
                }
                _ => BodySettle::Dirty,
            }
        }
    }
}

async fn write_simple_response(
    socket: &mut FilteredSocket,
    status: StatusCode,
    body: &'static str,
) -> Result<(), SocketError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("close"),
    );
    let mut keep_alive = false;
    write_response(
        socket,
        HttpResponse::new(status, headers, Some(crate::istream::from_bytes(body))),
        false,
        false,
        &mut keep_alive,
    )
    .await
}

/// Encode the status line + headers and stream the body out, choosing
/// content-length, chunked or close-delimited framing.
async fn write_response(
    socket: &mut FilteredSocket,
    response: HttpResponse,
    head_request: bool,
    http_1_0: bool,
    keep_alive: &mut bool,
) -> Result<(), SocketError> {
    let HttpResponse {
        status,
        mut headers,
        mut body,
    } = response;

    super::headers::strip_hop_headers(&mut headers);

    let body_allowed = !head_request && !super::status_has_no_body(status);
    let framing = if !body_allowed {
        // for HEAD we still announce the length we would have sent
        if head_request {
            if let Some(b) = &body {
                if let Some(n) = b.available(false) {
                    headers.insert(http::header::CONTENT_LENGTH, content_length_value(n));
                }
            }
        }
        body = None;
        BodyKind::None
    } else {
        match body.as_ref().and_then(|b| b.available(false)) {
            Some(n) => {
                headers.insert(http::header::CONTENT_LENGTH, content_length_value(n));
                if n == 0 {
                    body = None;
                    BodyKind::None
                } else {
                    BodyKind::Length(n)
                }
            }
            None if body.is_none() => {
                headers.insert(http::header::CONTENT_LENGTH, content_length_value(0));
                BodyKind::None
            }
            None if !http_1_0 => {
                headers.insert(
                    http::header::TRANSFER_ENCODING,
                    http::HeaderValue::from_static("chunked"),
                );
                BodyKind::Chunked
            }
            None => {
                *keep_alive = false;
                BodyKind::UntilClose
            }
        }
    };

    if !*keep_alive {
        headers.insert(
            http::header::CONNECTION,
            http::HeaderValue::from_static("close"),
        );
    } else if http_1_0 {
        headers.insert(
            http::header::CONNECTION,
            http::HeaderValue::from_static("keep-alive"),
        );
    }

    let mut head = BytesMut::with_capacity(256);
    head.put_slice(if http_1_0 { b"HTTP/1.0 " } else { b"HTTP/1.1 " });
    let mut status_buf = itoa::Buffer::new();
    head.put_slice(status_buf.format(status.as_u16()).as_bytes());
    head.put_u8(b' ');
    head.put_slice(status.canonical_reason().unwrap_or("Status").as_bytes());
    head.put_slice(b"\r\n");
    for (name, value) in &headers {
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"\r\n");
    socket.write_all(&head).await?;

    if let Some(body) = body {
        let stream = match framing {
            BodyKind::Chunked => Box::new(ChunkedIstream::new(body)) as BoxIstream,
            _ => body,
        };
        write_body(socket, stream).await?;
    }
    Ok(())
}

/// Stream a body to the socket, using the zero-copy path whenever the
/// stream can expose an fd and no filter is in the way.
pub(crate) async fn write_body(
    socket: &mut FilteredSocket,
    mut body: BoxIstream,
) -> Result<u64, SocketError> {
    let mut written = 0u64;
    loop {
        if socket.can_direct() {
            if let Some(src) = body.direct() {
                let max = src.remaining.map(|r| r as usize).unwrap_or(256 * 1024);
                let n = socket.write_direct(src, max.min(256 * 1024)).await?;
                if n > 0 {
                    body.consume_direct(n);
                    written += n as u64;
                    continue;
                }
            }
        }
        match crate::istream::next_chunk(body.as_mut()).await {
            Some(Ok(chunk)) => {
                written += chunk.len() as u64;
                socket.write_all(&chunk).await?;
            }
            Some(Err(e)) => {
                return Err(SocketError::Io(std::io::Error::other(e.to_string())));
            }
            None => return Ok(written),
        }
    }
}

fn content_length_value(n: u64) -> http::HeaderValue {
    let mut buf = itoa::Buffer::new();
    http::HeaderValue::from_str(buf.format(n)).unwrap()
}
