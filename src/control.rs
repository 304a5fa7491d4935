use crate::cache::HttpCache;
use crate::cluster::FailureManager;
use crate::session::SessionManager;
use crate::stats::{ProxyStats, StatsSnapshot};
use crate::translation::{TranslationCache, TranslationCommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// First bytes of every control datagram.
pub const CONTROL_MAGIC: u32 = 0x63_74_6c_30; // "ctl0"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCommand {
    /// drop translation cache entries matching the packet's key set
    TcacheInvalidate = 1,
    /// clear a node's failure state
    EnableNode = 2,
    /// soft-drain a node
    FadeNode = 3,
    /// reply with "ok" / "fade" / "failed"
    NodeStatus = 4,
    /// reply with the big-endian counter block
    Stats = 5,
    /// drop all HTTP cache entries under a tag
    FlushHttpCache = 6,
}

impl ControlCommand {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => ControlCommand::TcacheInvalidate,
            2 => ControlCommand::EnableNode,
            3 => ControlCommand::FadeNode,
            4 => ControlCommand::NodeStatus,
            5 => ControlCommand::Stats,
            6 => ControlCommand::FlushHttpCache,
            _ => return None,
        })
    }
}

/// Encode a control packet: magic + command + payload.
pub fn encode_packet(command: ControlCommand, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(&CONTROL_MAGIC.to_be_bytes());
    out.extend_from_slice(&(command as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_packet(data: &[u8]) -> Option<(ControlCommand, &[u8])> {
    if data.len() < 6 {
        return None;
    }
    if u32::from_be_bytes([data[0], data[1], data[2], data[3]]) != CONTROL_MAGIC {
        return None;
    }
    let command = ControlCommand::from_u16(u16::from_be_bytes([data[4], data[5]]))?;
    Some((command, &data[6..]))
}

/// Everything the control handlers reach into.
pub struct ControlDeps {
    pub translation_cache: Arc<TranslationCache>,
    pub http_cache: Arc<HttpCache>,
    pub failure_manager: Arc<FailureManager>,
    pub session_manager: Arc<SessionManager>,
    pub stats: Arc<ProxyStats>,
}

/// Small-command datagram endpoint: invalidation, node fade/enable,
/// status and stats queries.
pub struct ControlServer {
    socket: UdpSocket,
    deps: ControlDeps,
}

impl ControlServer {
    pub async fn bind(address: SocketAddr, deps: ControlDeps) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        info!("control: listening on {}", address);
        Ok(Self { socket, deps })
    }

    pub async fn run(self) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("control: receive failed: {}", e);
                    continue;
                }
            };
            let Some((command, payload)) = decode_packet(&buf[..n]) else {
                debug!("control: malformed packet from {}", peer);
                continue;
            };
            if let Some(reply) = self.handle(command, payload) {
                if let Err(e) = self.socket.send_to(&reply, peer).await {
                    warn!("control: reply to {} failed: {}", peer, e);
                }
            }
        }
    }

    fn handle(&self, command: ControlCommand, payload: &[u8]) -> Option<Vec<u8>> {
        match command {
            ControlCommand::TcacheInvalidate => {
                let features = parse_invalidate_payload(payload)?;
                self.deps.translation_cache.invalidate_features(features);
                None
            }
            ControlCommand::EnableNode => {
                let address = parse_address(payload)?;
                info!("control: enabling node {}", address);
                self.deps.failure_manager.enable(address);
                None
            }
            ControlCommand::FadeNode => {
                let address = parse_address(payload)?;
                info!("control: fading node {}", address);
                self.deps.failure_manager.fade(address);
                None
            }
            ControlCommand::NodeStatus => {
                let address = parse_address(payload)?;
                let status = match self.deps.failure_manager.get(address) {
                    None => "ok",
                    Some(info) if !info.check(Instant::now(), true) => "failed",
                    Some(info) if info.is_fading() => "fade",
                    Some(_) => "ok",
                };
                Some(status.as_bytes().to_vec())
            }
            ControlCommand::Stats => {
                let (incoming, outgoing, requests) = self.deps.stats.get();
                let rubber = &self.deps.http_cache.rubber;
                let snapshot = StatsSnapshot {
                    incoming_connections: incoming,
                    outgoing_connections: outgoing,
                    sessions: self.deps.session_manager.count() as u64,
                    http_requests: requests,
                    translation_cache_size: 0,
                    http_cache_size_brutto: rubber.brutto_size() as u64,
                    http_cache_size_netto: rubber.netto_size() as u64,
                    io_buffers_size: 0,
                };
                Some(snapshot.encode().to_vec())
            }
            ControlCommand::FlushHttpCache => {
                let tag = std::str::from_utf8(payload).ok()?;
                if tag.is_empty() {
                    self.deps.http_cache.flush_all();
                } else {
                    self.deps.http_cache.flush_tag(tag);
                }
                None
            }
        }
    }
}

fn parse_address(payload: &[u8]) -> Option<SocketAddr> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

/// Invalidation payload: a sequence of `[u16 cmd][u16 len][value]`
/// items naming translation request features.
fn parse_invalidate_payload(
    mut payload: &[u8],
) -> Option<HashMap<TranslationCommand, String>> {
    let mut features = HashMap::new();
    while !payload.is_empty() {
        if payload.len() < 4 {
            return None;
        }
        let cmd = u16::from_be_bytes([payload[0], payload[1]]);
        let len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        payload = &payload[4..];
        if payload.len() < len {
            return None;
        }
        let value = std::str::from_utf8(&payload[..len]).ok()?.to_string();
        payload = &payload[len..];
        features.insert(TranslationCommand::from_u16(cmd)?, value);
    }
    if features.is_empty() {
        None
    } else {
        Some(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_decoding() {
        let packet = encode_packet(ControlCommand::NodeStatus, b"10.0.0.1:80");
        let (command, payload) = decode_packet(&packet).unwrap();
        assert_eq!(command, ControlCommand::NodeStatus);
        assert_eq!(payload, b"10.0.0.1:80");

        assert!(decode_packet(b"nope").is_none());
        let mut bad_magic = packet.clone();
        bad_magic[0] = 0;
        assert!(decode_packet(&bad_magic).is_none());
    }

    #[test]
    fn invalidate_payload_parsing() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(TranslationCommand::Host as u16).to_be_bytes());
        payload.extend_from_slice(&4u16.to_be_bytes());
        payload.extend_from_slice(b"h.ex");
        payload.extend_from_slice(&(TranslationCommand::Uri as u16).to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(b"/x");

        let features = parse_invalidate_payload(&payload).unwrap();
        assert_eq!(features.get(&TranslationCommand::Host).unwrap(), "h.ex");
        assert_eq!(features.get(&TranslationCommand::Uri).unwrap(), "/x");

        assert!(parse_invalidate_payload(&payload[..3]).is_none());
        assert!(parse_invalidate_payload(b"").is_none());
    }
}
