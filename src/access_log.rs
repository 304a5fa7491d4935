use std::os::unix::io::OwnedFd;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::UnixDatagram;
use tracing::{info, warn};

/// One access-log record, serialized into a datagram for the child
/// logger (or printed through tracing when no child is configured).
#[derive(Debug, Default)]
pub struct AccessLogRecord {
    pub site: Option<String>,
    pub forwarded_to: Option<String>,
    pub host: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub content_length: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub duration: Duration,
}

mod tag {
    pub const SITE: u8 = 1;
    pub const FORWARDED_TO: u8 = 2;
    pub const HOST: u8 = 3;
    pub const X_FORWARDED_FOR: u8 = 4;
    pub const REFERER: u8 = 5;
    pub const USER_AGENT: u8 = 6;
    pub const METHOD: u8 = 7;
    pub const URI: u8 = 8;
    pub const STATUS: u8 = 9;
    pub const CONTENT_LENGTH: u8 = 10;
    pub const BYTES_RECEIVED: u8 = 11;
    pub const BYTES_SENT: u8 = 12;
    pub const DURATION_US: u8 = 13;
}

impl AccessLogRecord {
    /// Length-prefixed attribute list; numbers travel big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        fn put_str(out: &mut Vec<u8>, tag: u8, value: &str) {
            let bytes = value.as_bytes();
            let len = bytes.len().min(u16::MAX as usize);
            out.push(tag);
            out.extend_from_slice(&(len as u16).to_be_bytes());
            out.extend_from_slice(&bytes[..len]);
        }
        fn put_u64(out: &mut Vec<u8>, tag: u8, value: u64) {
            out.push(tag);
            out.extend_from_slice(&8u16.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }

        if let Some(v) = &self.site {
            put_str(&mut out, tag::SITE, v);
        }
        if let Some(v) = &self.forwarded_to {
            put_str(&mut out, tag::FORWARDED_TO, v);
        }
        if let Some(v) = &self.host {
            put_str(&mut out, tag::HOST, v);
        }
        if let Some(v) = &self.x_forwarded_for {
            put_str(&mut out, tag::X_FORWARDED_FOR, v);
        }
        if let Some(v) = &self.referer {
            put_str(&mut out, tag::REFERER, v);
        }
        if let Some(v) = &self.user_agent {
            put_str(&mut out, tag::USER_AGENT, v);
        }
        put_str(&mut out, tag::METHOD, &self.method);
        put_str(&mut out, tag::URI, &self.uri);
        put_u64(&mut out, tag::STATUS, self.status as u64);
        put_u64(&mut out, tag::CONTENT_LENGTH, self.content_length);
        put_u64(&mut out, tag::BYTES_RECEIVED, self.bytes_received);
        put_u64(&mut out, tag::BYTES_SENT, self.bytes_sent);
        put_u64(&mut out, tag::DURATION_US, self.duration.as_micros() as u64);

        let mut framed = Vec::with_capacity(out.len() + 2);
        framed.extend_from_slice(&(out.len() as u16).to_be_bytes());
        framed.extend_from_slice(&out);
        framed
    }
}

/// Where access records go: a spawned child logger over a socketpair,
/// or the structured log when none is configured.
pub enum AccessLogger {
    Child {
        socket: UnixDatagram,
        _child: tokio::process::Child,
    },
    Tracing,
}

impl AccessLogger {
    /// Spawn `command` with the receiving end of a datagram socketpair
    /// as its stdin; optionally dropping to uid/gid first.
    pub fn spawn(
        command: &str,
        args: &[String],
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> std::io::Result<Self> {
        let (parent, child_end) = std::os::unix::net::UnixDatagram::pair()?;
        parent.set_nonblocking(true)?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .kill_on_drop(true);
        {
            use std::os::unix::process::CommandExt;
            if let Some(uid) = uid {
                cmd.as_std_mut().uid(uid);
            }
            if let Some(gid) = gid {
                cmd.as_std_mut().gid(gid);
            }
        }
        let child = cmd.spawn()?;
        info!("access_log: spawned logger '{}'", command);

        Ok(AccessLogger::Child {
            socket: UnixDatagram::from_std(parent)?,
            _child: child,
        })
    }

    pub fn log(&self, record: AccessLogRecord) {
        match self {
            AccessLogger::Child { socket, .. } => {
                let datagram = record.encode();
                if let Err(e) = socket.try_send(&datagram) {
                    warn!("access_log: send failed: {}", e);
                }
            }
            AccessLogger::Tracing => {
                tracing::info!(
                    method = %record.method,
                    uri = %record.uri,
                    status = record.status,
                    host = record.host.as_deref().unwrap_or("-"),
                    forwarded_to = record.forwarded_to.as_deref().unwrap_or("-"),
                    bytes_in = record.bytes_received,
                    bytes_out = record.bytes_sent,
                    duration_us = record.duration.as_micros() as u64,
                    "access"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_encoding_is_framed() {
        let record = AccessLogRecord {
            host: Some("example.com".into()),
            method: "GET".into(),
            uri: "/x".into(),
            status: 200,
            duration: Duration::from_micros(1500),
            ..Default::default()
        };
        let data = record.encode();
        let inner_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        assert_eq!(inner_len + 2, data.len());
        // first attribute is the host string
        assert_eq!(data[2], tag::HOST);
        let host_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        assert_eq!(&data[5..5 + host_len], b"example.com");
    }
}
