pub mod filter;

pub use filter::{FilterError, NopFilter, SocketFilter, TlsClientFilter, TlsServerFilter};

use crate::istream::DirectSource;
use bytes::{Buf, BytesMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

const READ_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Any further transport (e.g. an already-terminated TLS stream) slots
/// in through the boxed variant, at the cost of the zero-copy path.
pub trait AsyncByteStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync {}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync> AsyncByteStream for T {}

pub enum SocketStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Boxed(Box<dyn AsyncByteStream>),
}

impl SocketStream {
    fn raw_fd(&self) -> RawFd {
        match self {
            SocketStream::Tcp(s) => s.as_raw_fd(),
            SocketStream::Unix(s) => s.as_raw_fd(),
            SocketStream::Boxed(_) => -1,
        }
    }

    fn supports_direct(&self) -> bool {
        !matches!(self, SocketStream::Boxed(_))
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            SocketStream::Tcp(s) => s.read_buf(buf).await,
            SocketStream::Unix(s) => s.read_buf(buf).await,
            SocketStream::Boxed(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<()> {
        while buf.has_remaining() {
            let n = match self {
                SocketStream::Tcp(s) => s.write_buf(buf).await?,
                SocketStream::Unix(s) => s.write_buf(buf).await?,
                SocketStream::Boxed(s) => s.write_buf(buf).await?,
            };
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
        }
        match self {
            SocketStream::Boxed(s) => tokio::io::AsyncWriteExt::flush(s).await,
            _ => Ok(()),
        }
    }

    async fn writable(&self) -> std::io::Result<()> {
        match self {
            SocketStream::Tcp(s) => s.writable().await,
            SocketStream::Unix(s) => s.writable().await,
            SocketStream::Boxed(_) => Ok(()),
        }
    }
}

/// A socket with read/write FIFO buffers and an optional bidirectional
/// byte filter (TLS). All protocol code reads decoded bytes out of the
/// read buffer and writes application bytes which the filter transforms
/// on the way out.
pub struct FilteredSocket {
    stream: SocketStream,
    filter: Option<Box<dyn SocketFilter>>,

    /// decoded bytes ready for the application
    read_buf: BytesMut,
    /// raw wire bytes not yet consumed by the filter
    wire_in: BytesMut,
    /// encoded bytes waiting to be written to the fd
    wire_out: BytesMut,

    read_timeout: Duration,
    write_timeout: Duration,

    /// fd-level EOF observed
    hangup: bool,
}

impl FilteredSocket {
    pub fn new_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self::new(SocketStream::Tcp(stream), None)
    }

    pub fn new_unix(stream: UnixStream) -> Self {
        Self::new(SocketStream::Unix(stream), None)
    }

    pub fn new(stream: SocketStream, filter: Option<Box<dyn SocketFilter>>) -> Self {
        Self {
            stream,
            filter,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            wire_in: BytesMut::new(),
            wire_out: BytesMut::new(),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            hangup: false,
        }
    }

    pub fn set_filter(&mut self, filter: Box<dyn SocketFilter>) {
        debug_assert!(self.read_buf.is_empty() && self.wire_in.is_empty());
        self.filter = Some(filter);
    }

    pub fn filter(&self) -> Option<&dyn SocketFilter> {
        self.filter.as_deref()
    }

    pub fn set_read_timeout(&mut self, t: Duration) {
        self.read_timeout = t;
    }

    pub fn set_write_timeout(&mut self, t: Duration) {
        self.write_timeout = t;
    }

    /// Decoded bytes waiting for the application.
    pub fn buffer(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn consume(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Take up to `n` buffered bytes as an owned chunk.
    pub fn take_buffer(&mut self, n: usize) -> bytes::Bytes {
        let n = n.min(self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.read_buf.is_empty()
    }

    /// The peer closed the connection at the fd level.
    pub fn saw_hangup(&self) -> bool {
        self.hangup
    }

    /// The peer announced an orderly protocol-level close (TLS
    /// close_notify). Distinct from `saw_hangup()`.
    pub fn peer_closed(&self) -> bool {
        self.filter.as_ref().map_or(false, |f| f.peer_closed())
    }

    /// All outgoing data has left the buffers (and the filter).
    pub fn is_drained(&self) -> bool {
        self.wire_out.is_empty() && self.filter.as_ref().map_or(true, |f| f.is_drained())
    }

    /// Eligible for zero-copy transfers straight on the fd.
    pub fn can_direct(&self) -> bool {
        self.filter.is_none() && self.stream.supports_direct()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.raw_fd()
    }

    /// Read more bytes into the buffer, applying the read timeout.
    /// Returns the number of new decoded bytes; 0 means the peer closed.
    pub async fn fill(&mut self) -> Result<usize, SocketError> {
        let before = self.read_buf.len();
        let read_timeout = self.read_timeout;
        loop {
            // drain any handshake output the filter wants to send first
            self.flush_filter_output().await?;

            let target = if self.filter.is_none() {
                &mut self.read_buf
            } else {
                &mut self.wire_in
            };
            let n = tokio::time::timeout(read_timeout, self.stream.read_buf(target))
                .await
                .map_err(|_| SocketError::ReadTimeout)??;

            if n == 0 {
                self.hangup = true;
                return Ok(self.read_buf.len() - before);
            }

            if let Some(filter) = &mut self.filter {
                let consumed = filter.decrypt(&self.wire_in, &mut self.read_buf)?;
                self.wire_in.advance(consumed);
                self.flush_filter_output().await?;
                if self.read_buf.len() == before {
                    // pure handshake traffic; keep reading
                    continue;
                }
            }
            return Ok(self.read_buf.len() - before);
        }
    }

    /// Like `fill()`, with an explicit timeout override.
    pub async fn fill_with_timeout(&mut self, timeout: Duration) -> Result<usize, SocketError> {
        let saved = self.read_timeout;
        self.read_timeout = timeout;
        let r = self.fill().await;
        self.read_timeout = saved;
        r
    }

    /// Queue application bytes for writing.
    pub fn queue_write(&mut self, data: &[u8]) -> Result<(), SocketError> {
        match &mut self.filter {
            None => {
                self.wire_out.extend_from_slice(data);
                Ok(())
            }
            Some(filter) => {
                filter.encrypt(data, &mut self.wire_out)?;
                Ok(())
            }
        }
    }

    /// Write queued bytes to the fd, applying the write timeout.
    pub async fn flush(&mut self) -> Result<(), SocketError> {
        if let Some(filter) = &mut self.filter {
            filter.take_pending_wire(&mut self.wire_out)?;
        }
        if self.wire_out.is_empty() {
            return Ok(());
        }
        tokio::time::timeout(
            self.write_timeout,
            self.stream.write_all_buf(&mut self.wire_out),
        )
        .await
        .map_err(|_| SocketError::WriteTimeout)?
        .map_err(SocketError::Io)
    }

    /// Queue and flush in one go.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SocketError> {
        self.queue_write(data)?;
        self.flush().await
    }

    async fn flush_filter_output(&mut self) -> Result<(), SocketError> {
        if let Some(filter) = &mut self.filter {
            filter.take_pending_wire(&mut self.wire_out)?;
        }
        if !self.wire_out.is_empty() {
            tokio::time::timeout(
                self.write_timeout,
                self.stream.write_all_buf(&mut self.wire_out),
            )
            .await
            .map_err(|_| SocketError::WriteTimeout)??;
        }
        Ok(())
    }

    /// Transfer bytes from `src` straight to the socket fd (sendfile for
    /// files, splice for pipes), bypassing userspace. Only valid when
    /// `can_direct()`. Returns the number of bytes moved; 0 means the
    /// source is exhausted.
    pub async fn write_direct(
        &mut self,
        src: DirectSource,
        max: usize,
    ) -> Result<usize, SocketError> {
        use crate::istream::pipe;
        debug_assert!(self.can_direct());
        debug_assert!(self.wire_out.is_empty());
        let out_fd = self.stream.raw_fd();
        loop {
            let r = match (src.kind, src.offset) {
                (crate::istream::FdType::File, Some(off)) => {
                    pipe::sendfile(out_fd, src.fd, off, max)
                }
                _ => pipe::splice(src.fd, out_fd, max),
            };
            match r {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::timeout(self.write_timeout, self.stream.writable())
                        .await
                        .map_err(|_| SocketError::WriteTimeout)??;
                }
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
    }

    /// Give up ownership of the fd without closing it in an orderly way.
    /// The socket must not be used afterwards.
    pub fn into_inner(self) -> SocketStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_through_buffers() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut a = FilteredSocket::new_unix(client);
        let mut b = FilteredSocket::new_unix(server);

        a.write_all(b"ping").await.unwrap();
        let n = b.fill().await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(b.buffer(), b"ping");
        b.consume(4);
        assert!(b.is_empty());
        assert!(a.is_drained());
    }

    #[tokio::test]
    async fn fill_reports_peer_close() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut b = FilteredSocket::new_unix(server);
        drop(client);
        let n = b.fill().await.unwrap();
        assert_eq!(n, 0);
        assert!(b.saw_hangup());
    }

    #[tokio::test]
    async fn read_timeout_fires() {
        let (_client, server) = UnixStream::pair().unwrap();
        let mut b = FilteredSocket::new_unix(server);
        let r = b
            .fill_with_timeout(Duration::from_millis(20))
            .await;
        assert!(matches!(r, Err(SocketError::ReadTimeout)));
    }
}
