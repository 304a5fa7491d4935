use super::address::CgiAddress;
use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::{byte_channel, BoxIstream, ByteSender};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

const FCGI_VERSION: u8 = 1;

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;

const REQUEST_ID: u16 = 1;

/// Encode one FastCGI record header.
fn put_record_header(out: &mut BytesMut, record_type: u8, content_length: u16) {
    out.put_u8(FCGI_VERSION);
    out.put_u8(record_type);
    out.put_u16(REQUEST_ID);
    out.put_u16(content_length);
    out.put_u8(0); // padding
    out.put_u8(0); // reserved
}

/// Append `data` as a sequence of records of the given type.
fn put_records(out: &mut BytesMut, record_type: u8, mut data: &[u8]) {
    loop {
        let chunk = data.len().min(0xffff);
        put_record_header(out, record_type, chunk as u16);
        out.put_slice(&data[..chunk]);
        data = &data[chunk..];
        if data.is_empty() {
            break;
        }
    }
}

/// FastCGI name-value pair encoding: 1-byte lengths below 128, 4-byte
/// big-endian with the high bit set otherwise.
fn put_param(out: &mut BytesMut, name: &str, value: &str) {
    fn put_len(out: &mut BytesMut, len: usize) {
        if len < 128 {
            out.put_u8(len as u8);
        } else {
            out.put_u32(len as u32 | 0x8000_0000);
        }
    }
    put_len(out, name.len());
    put_len(out, value.len());
    out.put_slice(name.as_bytes());
    out.put_slice(value.as_bytes());
}

fn serialize_params(
    address: &CgiAddress,
    method: &Method,
    request_headers: &HeaderMap,
    content_length: Option<u64>,
) -> BytesMut {
    let mut params = BytesMut::with_capacity(1024);
    put_param(&mut params, "GATEWAY_INTERFACE", "CGI/1.1");
    put_param(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
    put_param(&mut params, "REQUEST_METHOD", method.as_str());
    put_param(
        &mut params,
        "SCRIPT_FILENAME",
        address.action.as_deref().unwrap_or(&address.path),
    );
    put_param(
        &mut params,
        "SCRIPT_NAME",
        address.script_name.as_deref().unwrap_or(""),
    );
    if let Some(pi) = &address.path_info {
        put_param(&mut params, "PATH_INFO", pi);
    }
    if let Some(qs) = &address.query_string {
        put_param(&mut params, "QUERY_STRING", qs);
    }
    if let Some(root) = &address.document_root {
        put_param(&mut params, "DOCUMENT_ROOT", root);
    }
    if let Some(n) = content_length {
        let mut buf = itoa::Buffer::new();
        put_param(&mut params, "CONTENT_LENGTH", buf.format(n));
    }
    if let Some(ct) = request_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        put_param(&mut params, "CONTENT_TYPE", ct);
    }
    for (name, value) in request_headers {
        if name == http::header::CONTENT_TYPE || name == http::header::CONTENT_LENGTH {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        let env_name = format!(
            "HTTP_{}",
            name.as_str().to_ascii_uppercase().replace('-', "_")
        );
        put_param(&mut params, &env_name, value);
    }
    params
}

enum FcgiStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl FcgiStream {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            FcgiStream::Unix(s) => s.write_all(data).await,
            FcgiStream::Tcp(s) => s.write_all(data).await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            FcgiStream::Unix(s) => s.read_buf(buf).await,
            FcgiStream::Tcp(s) => s.read_buf(buf).await,
        }
    }
}

/// Send a request to a FastCGI responder. `remote` selects a TCP worker;
/// `None` connects to the unix socket named by `address.path`.
pub async fn send_fcgi_request(
    address: &CgiAddress,
    remote: Option<SocketAddr>,
    method: Method,
    request_headers: HeaderMap,
    body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    let mut stream = match remote {
        Some(addr) => FcgiStream::Tcp(TcpStream::connect(addr).await.map_err(ProxyError::Io)?),
        None => FcgiStream::Unix(
            UnixStream::connect(&address.path)
                .await
                .map_err(ProxyError::Io)?,
        ),
    };

    let content_length = body.as_ref().and_then(|b| b.available(false));

    // BEGIN_REQUEST + PARAMS + terminating empty PARAMS
    let mut out = BytesMut::with_capacity(2048);
    put_record_header(&mut out, FCGI_BEGIN_REQUEST, 8);
    out.put_u16(FCGI_RESPONDER);
    out.put_u8(0); // flags: no keep-conn
    out.put_slice(&[0; 5]);
    let params = serialize_params(address, &method, &request_headers, content_length);
    put_records(&mut out, FCGI_PARAMS, &params);
    put_record_header(&mut out, FCGI_PARAMS, 0);
    stream.write_all(&out).await.map_err(ProxyError::Io)?;

    // STDIN stream
    if let Some(mut body) = body {
        loop {
            match crate::istream::next_chunk(body.as_mut()).await {
                Some(Ok(chunk)) => {
                    let mut out = BytesMut::with_capacity(chunk.len() + 16);
                    put_records(&mut out, FCGI_STDIN, &chunk);
                    stream.write_all(&out).await.map_err(ProxyError::Io)?;
                }
                Some(Err(e)) => {
                    return Err(ProxyError::Io(std::io::Error::other(e.to_string())));
                }
                None => break,
            }
        }
    }
    let mut out = BytesMut::new();
    put_record_header(&mut out, FCGI_STDIN, 0);
    stream.write_all(&out).await.map_err(ProxyError::Io)?;

    // decode STDOUT records into a CGI-style response
    let mut decoder = RecordDecoder::default();
    let mut head = BytesMut::new();
    let head_end = loop {
        let records = decoder.pump(&mut stream).await?;
        for record in records {
            match record {
                Record::Stdout(data) => head.extend_from_slice(&data),
                Record::Stderr(data) => log_stderr(&data),
                Record::End => {
                    return Err(ProxyError::Protocol(
                        "FastCGI responder ended before response head".into(),
                    ))
                }
            }
        }
        if let Some(end) = super::cgi::find_head_end(&head) {
            break end;
        }
        if head.len() > 64 * 1024 {
            return Err(ProxyError::Protocol("FastCGI response head too large".into()));
        }
    };

    let head_bytes = head.split_to(head_end).freeze();
    let leftover = head.freeze();
    let (status, headers) = super::cgi::parse_cgi_head(&head_bytes)?;

    let (mut tx, rx) = byte_channel(64 * 1024);
    tokio::spawn(async move {
        if !leftover.is_empty() && tx.send(leftover).await.is_err() {
            return;
        }
        pump_fcgi_body(stream, decoder, tx).await;
    });

    Ok(HttpResponse::new(
        status,
        headers,
        Some(Box::new(rx) as BoxIstream),
    ))
}

async fn pump_fcgi_body(mut stream: FcgiStream, mut decoder: RecordDecoder, mut tx: ByteSender) {
    loop {
        match decoder.pump(&mut stream).await {
            Ok(records) => {
                for record in records {
                    match record {
                        Record::Stdout(data) => {
                            if !data.is_empty() && tx.send(data).await.is_err() {
                                return;
                            }
                        }
                        Record::Stderr(data) => log_stderr(&data),
                        Record::End => {
                            tx.close();
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tx.fail(crate::istream::IstreamError::Io(std::io::Error::other(
                    e.to_string(),
                )));
                return;
            }
        }
    }
}

fn log_stderr(data: &[u8]) {
    if let Ok(text) = std::str::from_utf8(data) {
        warn!("fcgi: stderr: {}", text.trim_end());
    }
}

enum Record {
    Stdout(Bytes),
    Stderr(Bytes),
    End,
}

#[derive(Default)]
struct RecordDecoder {
    buf: BytesMut,
}

impl RecordDecoder {
    /// Read from the stream until at least one full record is decoded.
    async fn pump(&mut self, stream: &mut FcgiStream) -> Result<Vec<Record>, ProxyError> {
        loop {
            let records = self.drain()?;
            if !records.is_empty() {
                return Ok(records);
            }
            let n = stream
                .read_buf(&mut self.buf)
                .await
                .map_err(ProxyError::Io)?;
            if n == 0 {
                return Err(ProxyError::Protocol(
                    "FastCGI connection closed mid-response".into(),
                ));
            }
        }
    }

    fn drain(&mut self) -> Result<Vec<Record>, ProxyError> {
        let mut records = Vec::new();
        loop {
            if self.buf.len() < 8 {
                return Ok(records);
            }
            let version = self.buf[0];
            if version != FCGI_VERSION {
                return Err(ProxyError::Protocol("bad FastCGI record version".into()));
            }
            let record_type = self.buf[1];
            let content_length =
                u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
            let padding = self.buf[6] as usize;
            let total = 8 + content_length + padding;
            if self.buf.len() < total {
                return Ok(records);
            }
            self.buf.advance(8);
            let content = self.buf.split_to(content_length).freeze();
            self.buf.advance(padding);
            match record_type {
                FCGI_STDOUT => records.push(Record::Stdout(content)),
                FCGI_STDERR => records.push(Record::Stderr(content)),
                FCGI_END_REQUEST => {
                    records.push(Record::End);
                    return Ok(records);
                }
                FCGI_BEGIN_REQUEST | FCGI_PARAMS | FCGI_STDIN => {
                    return Err(ProxyError::Protocol(
                        "unexpected FastCGI record from responder".into(),
                    ))
                }
                other => {
                    debug!("fcgi: ignoring record type {}", other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_length_encoding() {
        let mut out = BytesMut::new();
        put_param(&mut out, "A", "b");
        assert_eq!(&out[..], &[1, 1, b'A', b'b']);

        let mut out = BytesMut::new();
        let long = "x".repeat(200);
        put_param(&mut out, "N", &long);
        assert_eq!(out[0], 1);
        assert_eq!(&out[1..5], &[0x80, 0, 0, 200]);
    }

    #[test]
    fn record_framing_splits_large_payloads() {
        let mut out = BytesMut::new();
        let data = vec![0u8; 0x1_0001];
        put_records(&mut out, FCGI_STDIN, &data);
        // first record 0xffff, second 2 bytes
        assert_eq!(out[1], FCGI_STDIN);
        assert_eq!(u16::from_be_bytes([out[4], out[5]]), 0xffff);
    }

    #[test]
    fn decoder_reassembles_records() {
        let mut encoded = BytesMut::new();
        put_records(&mut encoded, FCGI_STDOUT, b"hello");
        put_record_header(&mut encoded, FCGI_END_REQUEST, 8);
        encoded.put_slice(&[0; 8]);

        let mut decoder = RecordDecoder::default();
        decoder.buf.extend_from_slice(&encoded);
        let records = decoder.drain().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], Record::Stdout(d) if &d[..] == b"hello"));
        assert!(matches!(records[1], Record::End));
    }
}
