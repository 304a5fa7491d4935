use super::address::CgiAddress;
use super::child::{ChildSpec, ChildStock};
use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::{byte_channel, BoxIstream, ByteSender};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::warn;

/// Web Application Socket: a FastCGI-like packet protocol spoken with
/// application worker children. Every packet is
/// `[u8 command][u32 big-endian length][payload]`; a request is a header
/// packet sequence followed by body data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WasCommand {
    Request = 1,
    Method = 2,
    Uri = 3,
    ScriptName = 4,
    PathInfo = 5,
    QueryString = 6,
    Header = 7,
    Parameter = 8,
    /// message has no body
    NoData = 9,
    /// total body length, if known (u64 payload)
    Length = 10,
    Data = 11,
    /// end of body data
    EndData = 12,
    /// response status (u16 payload)
    Status = 20,
}

impl WasCommand {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => WasCommand::Request,
            2 => WasCommand::Method,
            3 => WasCommand::Uri,
            4 => WasCommand::ScriptName,
            5 => WasCommand::PathInfo,
            6 => WasCommand::QueryString,
            7 => WasCommand::Header,
            8 => WasCommand::Parameter,
            9 => WasCommand::NoData,
            10 => WasCommand::Length,
            11 => WasCommand::Data,
            12 => WasCommand::EndData,
            20 => WasCommand::Status,
            _ => return None,
        })
    }
}

fn put_packet(out: &mut BytesMut, cmd: WasCommand, payload: &[u8]) {
    out.put_u8(cmd as u8);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
}

/// Dispatch a request to a WAS worker child.
pub async fn send_was_request(
    stock: &ChildStock,
    address: &CgiAddress,
    method: Method,
    request_headers: HeaderMap,
    body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    let spec = ChildSpec {
        executable: address.path.clone(),
        args: address.args.clone(),
        concurrency: 4,
    };
    let key = format!("was:{}", address.path);
    let guard = stock.get(&key, &spec).await?;
    let mut stream = guard.connect().await?;

    // request head
    let mut out = BytesMut::with_capacity(1024);
    put_packet(&mut out, WasCommand::Request, b"");
    put_packet(&mut out, WasCommand::Method, method.as_str().as_bytes());
    put_packet(
        &mut out,
        WasCommand::Uri,
        address.path_info.as_deref().unwrap_or("/").as_bytes(),
    );
    if let Some(sn) = &address.script_name {
        put_packet(&mut out, WasCommand::ScriptName, sn.as_bytes());
    }
    if let Some(pi) = &address.path_info {
        put_packet(&mut out, WasCommand::PathInfo, pi.as_bytes());
    }
    if let Some(qs) = &address.query_string {
        put_packet(&mut out, WasCommand::QueryString, qs.as_bytes());
    }
    for (name, value) in &request_headers {
        let Ok(value) = value.to_str() else { continue };
        let line = format!("{}={}", name.as_str(), value);
        put_packet(&mut out, WasCommand::Header, line.as_bytes());
    }

    // request body
    match body {
        None => put_packet(&mut out, WasCommand::NoData, b""),
        Some(mut body) => {
            if let Some(n) = body.available(false) {
                put_packet(&mut out, WasCommand::Length, &n.to_be_bytes());
            }
            stream.write_all(&out).await.map_err(ProxyError::Io)?;
            out.clear();
            loop {
                match crate::istream::next_chunk(body.as_mut()).await {
                    Some(Ok(chunk)) => {
                        let mut pkt = BytesMut::with_capacity(chunk.len() + 5);
                        put_packet(&mut pkt, WasCommand::Data, &chunk);
                        stream.write_all(&pkt).await.map_err(ProxyError::Io)?;
                    }
                    Some(Err(e)) => {
                        return Err(ProxyError::Io(std::io::Error::other(e.to_string())))
                    }
                    None => break,
                }
            }
            put_packet(&mut out, WasCommand::EndData, b"");
        }
    }
    stream.write_all(&out).await.map_err(ProxyError::Io)?;

    // response head
    let mut decoder = PacketDecoder::default();
    let mut status = None;
    let mut headers = HeaderMap::new();
    let body_mode = loop {
        let (cmd, payload) = decoder.next_packet(&mut stream).await?;
        match cmd {
            WasCommand::Status => {
                if payload.len() != 2 {
                    return Err(ProxyError::Protocol("bad WAS status payload".into()));
                }
                status = StatusCode::from_u16(u16::from_be_bytes([payload[0], payload[1]])).ok();
            }
            WasCommand::Header => {
                let Some(eq) = memchr::memchr(b'=', &payload) else {
                    return Err(ProxyError::Protocol("bad WAS header packet".into()));
                };
                let name = HeaderName::from_bytes(&payload[..eq])
                    .map_err(|_| ProxyError::Protocol("bad WAS header name".into()))?;
                let value = HeaderValue::from_bytes(&payload[eq + 1..])
                    .map_err(|_| ProxyError::Protocol("bad WAS header value".into()))?;
                headers.append(name, value);
            }
            WasCommand::NoData => break BodyMode::None,
            WasCommand::Length => {
                if payload.len() != 8 {
                    return Err(ProxyError::Protocol("bad WAS length payload".into()));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&payload);
                break BodyMode::Length(u64::from_be_bytes(buf));
            }
            WasCommand::Data => break BodyMode::FirstData(payload),
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected WAS packet {:?} in response head",
                    other
                )))
            }
        }
    };
    let status = status.ok_or_else(|| ProxyError::Protocol("WAS response without status".into()))?;

    let body = match body_mode {
        BodyMode::None => None,
        BodyMode::Length(n) => {
            let (tx, rx) = byte_channel(64 * 1024);
            tx.set_total(n);
            tokio::spawn(pump_was_body(stream, decoder, tx, guard));
            Some(Box::new(rx) as BoxIstream)
        }
        BodyMode::FirstData(first) => {
            let (mut tx, rx) = byte_channel(64 * 1024);
            tokio::spawn(async move {
                if !first.is_empty() && tx.send(first).await.is_err() {
                    return;
                }
                pump_was_body_inner(stream, decoder, tx).await;
                drop(guard);
            });
            Some(Box::new(rx) as BoxIstream)
        }
    };

    Ok(HttpResponse::new(status, headers, body))
}

enum BodyMode {
    None,
    Length(u64),
    FirstData(Bytes),
}

async fn pump_was_body(
    stream: UnixStream,
    decoder: PacketDecoder,
    tx: ByteSender,
    guard: super::child::ChildGuard,
) {
    pump_was_body_inner(stream, decoder, tx).await;
    drop(guard);
}

async fn pump_was_body_inner(mut stream: UnixStream, mut decoder: PacketDecoder, mut tx: ByteSender) {
    loop {
        match decoder.next_packet(&mut stream).await {
            Ok((WasCommand::Data, payload)) => {
                if !payload.is_empty() && tx.send(payload).await.is_err() {
                    return;
                }
            }
            Ok((WasCommand::EndData, _)) | Ok((WasCommand::NoData, _)) => {
                tx.close();
                return;
            }
            Ok((other, _)) => {
                warn!("was: unexpected packet {:?} in body", other);
                tx.fail(crate::istream::IstreamError::msg("WAS protocol violation"));
                return;
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

#[derive(Default)]
struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    async fn next_packet(
        &mut self,
        stream: &mut UnixStream,
    ) -> Result<(WasCommand, Bytes), ProxyError> {
        loop {
            if self.buf.len() >= 5 {
                let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                    as usize;
                if len > 16 * 1024 * 1024 {
                    return Err(ProxyError::Protocol("oversized WAS packet".into()));
                }
                if self.buf.len() >= 5 + len {
                    let cmd = WasCommand::from_u8(self.buf[0])
                        .ok_or_else(|| ProxyError::Protocol("unknown WAS command".into()))?;
                    self.buf.advance(5);
                    let payload = self.buf.split_to(len).freeze();
                    return Ok((cmd, payload));
                }
            }
            let n = stream
                .read_buf(&mut self.buf)
                .await
                .map_err(ProxyError::Io)?;
            if n == 0 {
                return Err(ProxyError::Protocol(
                    "WAS connection closed mid-message".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let mut out = BytesMut::new();
        put_packet(&mut out, WasCommand::Status, &200u16.to_be_bytes());
        put_packet(&mut out, WasCommand::Header, b"content-type=text/plain");
        a.write_all(&out).await.unwrap();

        let mut decoder = PacketDecoder::default();
        let (cmd, payload) = decoder.next_packet(&mut b).await.unwrap();
        assert_eq!(cmd, WasCommand::Status);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 200);
        let (cmd, payload) = decoder.next_packet(&mut b).await.unwrap();
        assert_eq!(cmd, WasCommand::Header);
        assert_eq!(&payload[..], b"content-type=text/plain");
    }
}
