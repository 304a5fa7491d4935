use bytes::BytesMut;
use std::io::{Read, Write};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("filter I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transforms bytes between the wire and the application in both
/// directions. The socket owns the filter; the filter owns any protocol
/// state (e.g. a TLS connection) but never the fd.
pub trait SocketFilter: Send {
    /// Consume wire bytes from `input`, appending any resulting plaintext
    /// to `out`. Returns the number of input bytes consumed.
    fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, FilterError>;

    /// Transform application bytes for the wire, appending to `out`.
    fn encrypt(&mut self, plain: &[u8], out: &mut BytesMut) -> Result<(), FilterError>;

    /// Wire bytes the filter wants to transmit independently of
    /// application writes (handshake records, close_notify).
    fn take_pending_wire(&mut self, out: &mut BytesMut) -> Result<(), FilterError>;

    /// Still inside the handshake?
    fn handshaking(&self) -> bool {
        false
    }

    /// The peer performed an orderly protocol-level close (TLS
    /// close_notify), as opposed to the fd being closed.
    fn peer_closed(&self) -> bool {
        false
    }

    /// No buffered data is stuck inside the filter.
    fn is_drained(&self) -> bool {
        true
    }
}

/// Transparent pass-through. A socket with a `NopFilter` still qualifies
/// for the buffered path but not for direct splice-out.
pub struct NopFilter;

impl SocketFilter for NopFilter {
    fn decrypt(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, FilterError> {
        out.extend_from_slice(input);
        Ok(input.len())
    }

    fn encrypt(&mut self, plain: &[u8], out: &mut BytesMut) -> Result<(), FilterError> {
        out.extend_from_slice(plain);
        Ok(())
    }

    fn take_pending_wire(&mut self, _out: &mut BytesMut) -> Result<(), FilterError> {
        Ok(())
    }
}

/// Server-side TLS through rustls' sans-io connection. Record crypto runs
/// inline on the worker; ring's AEAD is cheap enough that a dedicated
/// crypto thread pool is not worth the hand-off latency here.
pub struct TlsServerFilter {
    conn: rustls::ServerConnection,
    peer_closed: bool,
}

impl TlsServerFilter {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(Self {
            conn: rustls::ServerConnection::new(config)?,
            peer_closed: false,
        })
    }

    /// Negotiated ALPN protocol, once the handshake is done.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// SNI server name presented by the client.
    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }
}

impl SocketFilter for TlsServerFilter {
    fn decrypt(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<usize, FilterError> {
        let total = input.len();
        while !input.is_empty() {
            let n = self.conn.read_tls(&mut input)?;
            if n == 0 {
                break;
            }
            let io_state = self
                .conn
                .process_new_packets()
                .map_err(FilterError::Tls)?;
            if io_state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
        let consumed = total - input.len();

        let mut buf = [0u8; 16384];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(consumed)
    }

    fn encrypt(&mut self, plain: &[u8], out: &mut BytesMut) -> Result<(), FilterError> {
        self.conn.writer().write_all(plain)?;
        self.take_pending_wire(out)
    }

    fn take_pending_wire(&mut self, out: &mut BytesMut) -> Result<(), FilterError> {
        while self.conn.wants_write() {
            let mut writer = WireWriter(out);
            self.conn.write_tls(&mut writer)?;
        }
        Ok(())
    }

    fn handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn is_drained(&self) -> bool {
        !self.conn.wants_write()
    }
}

/// Client-side TLS for backend connections.
pub struct TlsClientFilter {
    conn: rustls::ClientConnection,
    peer_closed: bool,
}

impl TlsClientFilter {
    pub fn new(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            conn: rustls::ClientConnection::new(config, server_name)?,
            peer_closed: false,
        })
    }
}

impl SocketFilter for TlsClientFilter {
    fn decrypt(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<usize, FilterError> {
        let total = input.len();
        while !input.is_empty() {
            let n = self.conn.read_tls(&mut input)?;
            if n == 0 {
                break;
            }
            let io_state = self
                .conn
                .process_new_packets()
                .map_err(FilterError::Tls)?;
            if io_state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
        let consumed = total - input.len();

        let mut buf = [0u8; 16384];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(consumed)
    }

    fn encrypt(&mut self, plain: &[u8], out: &mut BytesMut) -> Result<(), FilterError> {
        self.conn.writer().write_all(plain)?;
        self.take_pending_wire(out)
    }

    fn take_pending_wire(&mut self, out: &mut BytesMut) -> Result<(), FilterError> {
        while self.conn.wants_write() {
            let mut writer = WireWriter(out);
            self.conn.write_tls(&mut writer)?;
        }
        Ok(())
    }

    fn handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    fn is_drained(&self) -> bool {
        !self.conn.wants_write()
    }
}

struct WireWriter<'a>(&'a mut BytesMut);

impl Write for WireWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_filter_is_transparent() {
        let mut f = NopFilter;
        let mut out = BytesMut::new();
        assert_eq!(f.decrypt(b"abc", &mut out).unwrap(), 3);
        f.encrypt(b"def", &mut out).unwrap();
        assert_eq!(&out[..], b"abcdef");
        assert!(f.is_drained());
    }
}
