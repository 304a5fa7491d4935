use bytes::{Bytes, BytesMut};
use slab::Slab;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Handle to a body held in the rubber arena.
pub type RubberId = usize;

struct RubberItem {
    data: Bytes,
}

struct RubberInner {
    max_size: usize,
    in_use: usize,
    items: Slab<RubberItem>,
}

/// Arena for cache bodies, kept apart from the general heap so cached
/// payloads cannot fragment it. Readers lease the body as a refcounted
/// slice: an evicted item's memory survives until the last reader drops
/// its lease.
pub struct Rubber {
    inner: Mutex<RubberInner>,
}

impl Rubber {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RubberInner {
                max_size,
                in_use: 0,
                items: Slab::new(),
            }),
        })
    }

    /// Store a body. `None` when the arena has no room left; the caller
    /// skips caching in that case.
    pub fn add(&self, data: Bytes) -> Option<RubberId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use + data.len() > inner.max_size {
            metrics::counter!("proxy_cache_rubber_full_total").increment(1);
            return None;
        }
        inner.in_use += data.len();
        Some(inner.items.insert(RubberItem { data }))
    }

    /// Lease the body of an item. The clone is cheap and pins the bytes.
    pub fn get(&self, id: RubberId) -> Option<Bytes> {
        self.inner.lock().unwrap().items.get(id).map(|i| i.data.clone())
    }

    pub fn remove(&self, id: RubberId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.contains(id) {
            let item = inner.items.remove(id);
            inner.in_use -= item.data.len();
        }
    }

    /// Net payload bytes currently stored.
    pub fn netto_size(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    /// Payload plus slab bookkeeping overhead.
    pub fn brutto_size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.in_use + inner.items.capacity() * std::mem::size_of::<RubberItem>()
    }

    /// Give back slack memory. Called from a periodic timer.
    pub fn compress(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.shrink_to_fit();
        debug!(
            "rubber: compressed, netto={}, slots={}",
            inner.in_use,
            inner.items.len()
        );
    }
}

/// Periodically ask the arena to compact itself.
pub fn spawn_compress_timer(rubber: Arc<Rubber>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            rubber.compress();
        }
    })
}

/// Collect a stream into the arena, bounded by `size_limit`. Returns
/// `None` (and stores nothing) when the stream errors, overruns the
/// limit, or the arena is full; a partial body never becomes visible.
pub async fn sink_rubber(
    rubber: &Rubber,
    mut stream: crate::istream::BoxIstream,
    size_limit: u64,
) -> Option<(RubberId, u64)> {
    let mut buf = BytesMut::new();
    loop {
        match crate::istream::next_chunk(stream.as_mut()).await {
            Some(Ok(chunk)) => {
                if buf.len() as u64 + chunk.len() as u64 > size_limit {
                    debug!("rubber: body exceeds cacheable size limit, discarding");
                    return None;
                }
                buf.extend_from_slice(&chunk);
            }
            Some(Err(e)) => {
                debug!("rubber: body sink failed: {}", e);
                return None;
            }
            None => break,
        }
    }
    let len = buf.len() as u64;
    let id = rubber.add(buf.freeze())?;
    Some((id, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_remove_accounting() {
        let rubber = Rubber::new(100);
        let id = rubber.add(Bytes::from("hello")).unwrap();
        assert_eq!(rubber.netto_size(), 5);
        assert_eq!(rubber.get(id).unwrap(), Bytes::from("hello"));
        rubber.remove(id);
        assert_eq!(rubber.netto_size(), 0);
        assert!(rubber.get(id).is_none());
    }

    #[test]
    fn rejects_when_full() {
        let rubber = Rubber::new(8);
        assert!(rubber.add(Bytes::from("12345678")).is_some());
        assert!(rubber.add(Bytes::from("x")).is_none());
    }

    #[test]
    fn lease_survives_eviction() {
        let rubber = Rubber::new(100);
        let id = rubber.add(Bytes::from("persistent")).unwrap();
        let lease = rubber.get(id).unwrap();
        rubber.remove(id);
        assert_eq!(lease, Bytes::from("persistent"));
    }

    #[tokio::test]
    async fn sink_discards_oversized_bodies() {
        let rubber = Rubber::new(1024);
        let r = sink_rubber(&rubber, crate::istream::from_bytes("too large"), 4).await;
        assert!(r.is_none());
        assert_eq!(rubber.netto_size(), 0);
    }

    #[tokio::test]
    async fn sink_stores_complete_bodies() {
        let rubber = Rubber::new(1024);
        let (id, len) = sink_rubber(&rubber, crate::istream::from_bytes("body"), 100)
            .await
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(rubber.get(id).unwrap(), Bytes::from("body"));
    }
}
