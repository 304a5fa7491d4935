use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, reported through the control channel and
/// mirrored into the `metrics` facade at the call sites.
#[derive(Default)]
pub struct ProxyStats {
    pub incoming_connections: AtomicU64,
    pub outgoing_connections: AtomicU64,
    pub http_requests: AtomicU64,
}

/// The fixed-layout big-endian counter block answered to a control
/// stats query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub incoming_connections: u64,
    pub outgoing_connections: u64,
    pub sessions: u64,
    pub http_requests: u64,
    pub translation_cache_size: u64,
    pub http_cache_size_brutto: u64,
    pub http_cache_size_netto: u64,
    pub io_buffers_size: u64,
}

impl StatsSnapshot {
    pub const WIRE_SIZE: usize = 8 * 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        for (i, value) in [
            self.incoming_connections,
            self.outgoing_connections,
            self.sessions,
            self.http_requests,
            self.translation_cache_size,
            self.http_cache_size_brutto,
            self.http_cache_size_netto,
            self.io_buffers_size,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 8..(i + 1) * 8].copy_from_slice(&value.to_be_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::WIRE_SIZE {
            return None;
        }
        let u = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(buf)
        };
        Some(Self {
            incoming_connections: u(0),
            outgoing_connections: u(1),
            sessions: u(2),
            http_requests: u(3),
            translation_cache_size: u(4),
            http_cache_size_brutto: u(5),
            http_cache_size_netto: u(6),
            io_buffers_size: u(7),
        })
    }
}

impl ProxyStats {
    pub fn connection_opened(&self) {
        self.incoming_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outgoing_connection(&self) {
        self.outgoing_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_handled(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.incoming_connections.load(Ordering::Relaxed),
            self.outgoing_connections.load(Ordering::Relaxed),
            self.http_requests.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_wire_round_trip() {
        let snapshot = StatsSnapshot {
            incoming_connections: 1,
            outgoing_connections: 2,
            sessions: 3,
            http_requests: 0xdead_beef,
            translation_cache_size: 5,
            http_cache_size_brutto: 6,
            http_cache_size_netto: 7,
            io_buffers_size: 8,
        };
        let encoded = snapshot.encode();
        // big-endian layout
        assert_eq!(&encoded[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(StatsSnapshot::decode(&encoded), Some(snapshot));
        assert_eq!(StatsSnapshot::decode(&encoded[..10]), None);
    }
}
