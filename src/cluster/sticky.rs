use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Non-hashing stickiness: remembers which member served a sticky hash.
/// Entries are validated against the live member set by the caller; a
/// vanished or failed member simply falls out.
pub struct StickyCache {
    map: LruCache<u64, String>,
}

impl StickyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    pub fn get(&mut self, sticky_hash: u64) -> Option<String> {
        self.map.get(&sticky_hash).cloned()
    }

    pub fn put(&mut self, sticky_hash: u64, member_key: String) {
        self.map.put(sticky_hash, member_key);
    }

    pub fn remove(&mut self, sticky_hash: u64) {
        self.map.pop(&sticky_hash);
    }
}

/// Token-based round robin. The caller filters out inadmissible members;
/// this only hands out rotating indices.
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }

    pub fn next(&self, len: usize) -> usize {
        debug_assert!(len > 0);
        self.next.fetch_add(1, Ordering::Relaxed) % len
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_cache_lru_evicts() {
        let mut cache = StickyCache::new(2);
        cache.put(1, "a".into());
        cache.put(2, "b".into());
        cache.put(3, "c".into());
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2).as_deref(), Some("b"));
    }

    #[test]
    fn round_robin_cycles() {
        let rr = RoundRobin::new();
        assert_eq!(rr.next(3), 0);
        assert_eq!(rr.next(3), 1);
        assert_eq!(rr.next(3), 2);
        assert_eq!(rr.next(3), 0);
    }
}
