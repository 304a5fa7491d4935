use crate::http1::server::RequestHandler;
use crate::http1::{HttpResponse, IncomingRequest};
use crate::istream::{BoxIstream, Istream, IstreamError};
use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// Serve a multiplexed HTTP/2 connection (negotiated via ALPN) on an
/// already-terminated byte stream, feeding the same request handler as
/// the HTTP/1 path. hyper provides the framing, flow-control windows
/// and per-stream state.
pub async fn serve_h2<S, H>(
    stream: S,
    peer_addr: SocketAddr,
    secure: bool,
    handler: Arc<H>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    let service = service_fn(move |request: hyper::Request<Incoming>| {
        let handler = handler.clone();
        async move {
            let response = handler
                .handle(adapt_request(request, peer_addr, secure))
                .await;
            Ok::<_, std::convert::Infallible>(adapt_response(response))
        }
    });

    // the ALPN-selected client speaks the h2 preface, which the auto
    // builder detects
    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
}

fn adapt_request(
    request: hyper::Request<Incoming>,
    peer_addr: SocketAddr,
    secure: bool,
) -> IncomingRequest {
    let (parts, body) = request.into_parts();
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let has_body = !body.is_end_stream();
    IncomingRequest {
        method: parts.method,
        uri,
        headers: parts.headers,
        body: has_body.then(|| Box::new(H2BodyIstream { body }) as BoxIstream),
        // HTTP/2 has no Expect mechanism; flow control covers it
        expect_100: false,
        peer_addr,
        secure,
    }
}

fn adapt_response(response: HttpResponse) -> hyper::Response<IstreamBody> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(IstreamBody {
            stream: response.body,
        })
        .expect("response build cannot fail")
}

/// hyper request body → Istream. The stream is pulled lazily, so h2
/// window credit is only granted as the handler consumes; a slow
/// handler throttles the peer's upload.
struct H2BodyIstream {
    body: Incoming,
}

impl Istream for H2BodyIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        let hint = self.body.size_hint();
        if partial {
            Some(0)
        } else {
            hint.exact()
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            match Pin::new(&mut self.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    match frame.into_data() {
                        Ok(data) => {
                            if data.is_empty() {
                                continue;
                            }
                            return Poll::Ready(Some(Ok(data)));
                        }
                        // trailers are dropped
                        Err(_) => continue,
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!("h2: request body failed: {}", e);
                    return Poll::Ready(Some(Err(IstreamError::Io(std::io::Error::other(
                        e.to_string(),
                    )))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Istream → hyper response body.
pub struct IstreamBody {
    stream: Option<BoxIstream>,
}

impl Body for IstreamBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Poll::Ready(None);
        };
        match stream.poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => {
                self.stream = None;
                Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))))
            }
            Poll::Ready(None) => {
                self.stream = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.stream.is_none()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        match self.stream.as_ref().and_then(|s| s.available(false)) {
            Some(n) => hyper::body::SizeHint::with_exact(n),
            None if self.stream.is_none() => hyper::body::SizeHint::with_exact(0),
            None => hyper::body::SizeHint::default(),
        }
    }
}

/// Async TLS byte stream over rustls' sans-io server connection, used
/// by TLS listeners to terminate the handshake and learn the ALPN
/// protocol before picking the HTTP/1 or HTTP/2 path.
pub struct TlsByteStream {
    tcp: tokio::net::TcpStream,
    conn: rustls::ServerConnection,
    wire_out: bytes::BytesMut,
}

impl TlsByteStream {
    pub fn new(tcp: tokio::net::TcpStream, conn: rustls::ServerConnection) -> Self {
        Self {
            tcp,
            conn,
            wire_out: bytes::BytesMut::new(),
        }
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    /// Drive the handshake to completion.
    pub async fn handshake(&mut self) -> std::io::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut wire_in = bytes::BytesMut::with_capacity(16 * 1024);
        while self.conn.is_handshaking() {
            while self.conn.wants_write() {
                let mut buf = Vec::new();
                self.conn.write_tls(&mut buf)?;
                self.tcp.write_all(&buf).await?;
            }
            if !self.conn.is_handshaking() {
                break;
            }
            let n = self.tcp.read_buf(&mut wire_in).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            let mut slice: &[u8] = &wire_in;
            while !slice.is_empty() {
                let consumed = self.conn.read_tls(&mut slice)?;
                if consumed == 0 {
                    break;
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
            }
            let remaining = slice.len();
            let consumed_total = wire_in.len() - remaining;
            let _ = wire_in.split_to(consumed_total);
        }
        while self.conn.wants_write() {
            let mut buf = Vec::new();
            self.conn.write_tls(&mut buf)?;
            self.tcp.write_all(&buf).await?;
        }
        Ok(())
    }
}

impl tokio::io::AsyncRead for TlsByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        use std::io::Read;
        loop {
            // plaintext already decoded?
            match self.conn.reader().read(buf.initialize_unfilled()) {
                Ok(0) => {}
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Poll::Ready(Ok(()))
                }
                Err(e) => return Poll::Ready(Err(e)),
            }

            // pull more wire bytes
            let mut wire = [0u8; 16 * 1024];
            let mut wire_buf = tokio::io::ReadBuf::new(&mut wire);
            match Pin::new(&mut self.tcp).poll_read(cx, &mut wire_buf) {
                Poll::Ready(Ok(())) => {
                    let data = wire_buf.filled();
                    if data.is_empty() {
                        // fd closed
                        return Poll::Ready(Ok(()));
                    }
                    let mut slice: &[u8] = data;
                    while !slice.is_empty() {
                        if self.conn.read_tls(&mut slice)? == 0 {
                            break;
                        }
                        self.conn
                            .process_new_packets()
                            .map_err(|e| std::io::Error::other(e.to_string()))?;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl tokio::io::AsyncWrite for TlsByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        use std::io::Write;
        let n = self.conn.writer().write(data)?;
        while self.conn.wants_write() {
            let mut buf = Vec::new();
            self.conn.write_tls(&mut buf)?;
            self.wire_out.extend_from_slice(&buf);
        }
        // opportunistically drain the wire buffer
        while !self.wire_out.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.tcp).poll_write(cx, &this.wire_out) {
                Poll::Ready(Ok(written)) => {
                    let _ = this.wire_out.split_to(written);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.conn.wants_write() {
            let mut buf = Vec::new();
            self.conn.write_tls(&mut buf)?;
            self.wire_out.extend_from_slice(&buf);
        }
        while !self.wire_out.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.tcp).poll_write(cx, &this.wire_out) {
                Poll::Ready(Ok(written)) => {
                    let _ = this.wire_out.split_to(written);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut self.tcp).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.conn.send_close_notify();
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.tcp).poll_shutdown(cx),
            other => other,
        }
    }
}
