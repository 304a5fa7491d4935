pub mod ring;
pub mod sticky;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use ring::HashRing;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sticky::{RoundRobin, StickyCache};
use tracing::{debug, info};

/// How long a member stays hard-failed after a connect error.
pub const CONNECT_FAILURE_DURATION: Duration = Duration::from_secs(20);

/// Connection attempts per request, by cluster size (smaller clusters
/// get fewer retries because there is less to fall over to).
pub const fn calculate_retries(members: usize) -> u32 {
    match members {
        0 | 1 => 0,
        2 => 1,
        3 => 2,
        _ => 3,
    }
}

/// Shared per-address failure state. `fade` is a soft state (still
/// admissible when nothing better exists); `failed` rejects the member
/// until its deadline passes.
pub struct FailureInfo {
    fade: AtomicBool,
    failed_until: Mutex<Option<Instant>>,
}

impl FailureInfo {
    fn new() -> Self {
        Self {
            fade: AtomicBool::new(false),
            failed_until: Mutex::new(None),
        }
    }

    /// Is the member admissible now?
    pub fn check(&self, now: Instant, allow_fade: bool) -> bool {
        {
            let failed = self.failed_until.lock().unwrap();
            if let Some(until) = *failed {
                if now < until {
                    return false;
                }
            }
        }
        allow_fade || !self.fade.load(Ordering::Relaxed)
    }

    pub fn set_connect_failed(&self, now: Instant, duration: Duration) {
        *self.failed_until.lock().unwrap() = Some(now + duration);
    }

    pub fn unset_connect_failed(&self) {
        *self.failed_until.lock().unwrap() = None;
    }

    pub fn set_fade(&self, fade: bool) {
        self.fade.store(fade, Ordering::Relaxed);
    }

    pub fn is_fading(&self) -> bool {
        self.fade.load(Ordering::Relaxed)
    }
}

/// Process-wide registry of failure state, shared by every cluster so a
/// member known bad through one route is avoided everywhere.
#[derive(Default)]
pub struct FailureManager {
    map: DashMap<SocketAddr, Arc<FailureInfo>>,
}

impl FailureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&self, address: SocketAddr) -> Arc<FailureInfo> {
        if let Some(info) = self.map.get(&address) {
            return info.value().clone();
        }
        self.map
            .entry(address)
            .or_insert_with(|| Arc::new(FailureInfo::new()))
            .clone()
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<FailureInfo>> {
        self.map.get(&address).map(|e| e.value().clone())
    }

    /// Control-channel hooks: force a member good / fading.
    pub fn enable(&self, address: SocketAddr) {
        let info = self.make(address);
        info.unset_connect_failed();
        info.set_fade(false);
    }

    pub fn fade(&self, address: SocketAddr) {
        self.make(address).set_fade(true);
    }
}

/// One cluster member, static or discovered.
pub struct Member {
    pub key: String,
    pub address: SocketAddr,
    pub failure: Arc<FailureInfo>,
}

/// The zero-conf member pool: an ordered map of members mutated by
/// discovery callbacks, a lazily rebuilt consistent-hash ring for sticky
/// routing, an optional sticky cache, and a round-robin fallback.
pub struct Cluster {
    name: String,
    failure_manager: Arc<FailureManager>,
    members: Mutex<BTreeMap<String, Arc<Member>>>,
    /// flat snapshot + ring; swapped wholesale when `dirty`
    active: ArcSwap<ActiveSet>,
    dirty: AtomicBool,
    sticky_cache: Option<Mutex<StickyCache>>,
    rr: RoundRobin,
}

#[derive(Default)]
struct ActiveSet {
    members: Vec<Arc<Member>>,
    ring: Option<HashRing>,
}

impl Cluster {
    pub fn new(
        name: String,
        failure_manager: Arc<FailureManager>,
        use_sticky_cache: bool,
    ) -> Self {
        Self {
            name,
            failure_manager,
            members: Mutex::new(BTreeMap::new()),
            active: ArcSwap::from_pointee(ActiveSet::default()),
            dirty: AtomicBool::new(false),
            sticky_cache: use_sticky_cache.then(|| Mutex::new(StickyCache::new(32768))),
            rr: RoundRobin::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zeroconf callback: a member appeared or changed its address.
    /// A re-announce reuses the existing failure record for the address,
    /// so fade state survives rediscovery.
    pub fn on_new(&self, key: &str, address: SocketAddr) {
        let failure = self.failure_manager.make(address);
        let member = Arc::new(Member {
            key: key.to_string(),
            address,
            failure,
        });
        info!("cluster {}: member up, key={}, address={}", self.name, key, address);
        self.members.lock().unwrap().insert(key.to_string(), member);
        self.dirty.store(true, Ordering::Release);
    }

    /// Zeroconf callback: a member disappeared.
    pub fn on_remove(&self, key: &str) {
        info!("cluster {}: member down, key={}", self.name, key);
        self.members.lock().unwrap().remove(key);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn member_keys(&self) -> Vec<String> {
        self.members.lock().unwrap().keys().cloned().collect()
    }

    fn refresh_active(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let members: Vec<Arc<Member>> =
            self.members.lock().unwrap().values().cloned().collect();
        let ring = if self.sticky_cache.is_none() {
            Some(HashRing::build(members.iter().map(|m| m.address)))
        } else {
            None
        };
        self.active.store(Arc::new(ActiveSet { members, ring }));
        self.rr.reset();
    }

    /// Select a member. A non-zero `sticky_hash` requests consistent
    /// routing; zero (or a missing hash) falls back to round-robin over
    /// admissible members.
    pub fn pick(&self, now: Instant, sticky_hash: u64) -> Option<Arc<Member>> {
        self.refresh_active();
        let active = self.active.load_full();
        if active.members.is_empty() {
            return None;
        }

        if active.members.len() == 1 {
            // single member: both the ring and round-robin degenerate
            return Some(active.members[0].clone());
        }

        if sticky_hash != 0 {
            if let Some(cache) = &self.sticky_cache {
                if let Some(member) = self.pick_sticky_cached(&active, cache, now, sticky_hash) {
                    return Some(member);
                }
                // fall through to round-robin and memoise below
                let member = self.pick_round_robin(&active, now)?;
                cache
                    .lock()
                    .unwrap()
                    .put(sticky_hash, member.key.clone());
                return Some(member);
            }
            if let Some(ring) = &active.ring {
                return self.pick_ring(&active, ring, now, sticky_hash);
            }
        }

        self.pick_round_robin(&active, now)
    }

    fn pick_ring(
        &self,
        active: &ActiveSet,
        ring: &HashRing,
        now: Instant,
        sticky_hash: u64,
    ) -> Option<Arc<Member>> {
        let mut index = ring.pick(sticky_hash)?;
        let mut hash = sticky_hash;
        let mut hops = active.members.len();
        loop {
            let member = &active.members[index];
            hops -= 1;
            if hops == 0 || member.failure.check(now, false) {
                return Some(member.clone());
            }
            // known-bad node: advance to the next ring position
            let (next_hash, next_index) = ring.find_next(hash)?;
            hash = next_hash;
            index = next_index;
        }
    }

    fn pick_sticky_cached(
        &self,
        active: &ActiveSet,
        cache: &Mutex<StickyCache>,
        now: Instant,
        sticky_hash: u64,
    ) -> Option<Arc<Member>> {
        let cached_key = cache.lock().unwrap().get(sticky_hash)?;
        let member = active
            .members
            .iter()
            .find(|m| m.key == cached_key)?
            .clone();
        if member.failure.check(now, false) {
            return Some(member);
        }
        cache.lock().unwrap().remove(sticky_hash);
        None
    }

    fn pick_round_robin(&self, active: &ActiveSet, now: Instant) -> Option<Arc<Member>> {
        let n = active.members.len();
        for _ in 0..n {
            let index = self.rr.next(n);
            let member = &active.members[index];
            if member.failure.check(now, false) {
                return Some(member.clone());
            }
        }
        // everything is failing; soft-degrade by allowing fade members
        for _ in 0..n {
            let index = self.rr.next(n);
            let member = &active.members[index];
            if member.failure.check(now, true) {
                debug!(
                    "cluster {}: only fading members left, using {}",
                    self.name, member.key
                );
                return Some(member.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(members: &[(&str, &str)], sticky_cache: bool) -> Cluster {
        let c = Cluster::new(
            "test".into(),
            Arc::new(FailureManager::new()),
            sticky_cache,
        );
        for (key, addr) in members {
            c.on_new(key, addr.parse().unwrap());
        }
        c
    }

    #[test]
    fn empty_cluster_yields_none() {
        let c = cluster(&[], false);
        assert!(c.pick(Instant::now(), 1).is_none());
    }

    #[test]
    fn sticky_hash_is_persistent() {
        let c = cluster(
            &[
                ("a", "10.0.0.1:80"),
                ("b", "10.0.0.2:80"),
                ("c", "10.0.0.3:80"),
            ],
            false,
        );
        let now = Instant::now();
        let first = c.pick(now, 0xfeed).unwrap();
        for _ in 0..10 {
            assert_eq!(c.pick(now, 0xfeed).unwrap().key, first.key);
        }
    }

    #[test]
    fn failed_member_is_walked_over() {
        let c = cluster(
            &[
                ("a", "10.0.0.1:80"),
                ("b", "10.0.0.2:80"),
                ("c", "10.0.0.3:80"),
            ],
            false,
        );
        let now = Instant::now();
        let first = c.pick(now, 0xdead).unwrap();
        first
            .failure
            .set_connect_failed(now, CONNECT_FAILURE_DURATION);

        let second = c.pick(now, 0xdead).unwrap();
        assert_ne!(first.key, second.key);

        // after the deadline the original owner comes back
        let later = now + CONNECT_FAILURE_DURATION + Duration::from_secs(1);
        assert_eq!(c.pick(later, 0xdead).unwrap().key, first.key);
    }

    #[test]
    fn single_member_bypasses_ring_and_rr() {
        let c = cluster(&[("only", "10.0.0.9:80")], false);
        let now = Instant::now();
        assert_eq!(c.pick(now, 0).unwrap().key, "only");
        assert_eq!(c.pick(now, 12345).unwrap().key, "only");
    }

    #[test]
    fn round_robin_rotates() {
        let c = cluster(&[("a", "10.0.0.1:80"), ("b", "10.0.0.2:80")], false);
        let now = Instant::now();
        let first = c.pick(now, 0).unwrap();
        let second = c.pick(now, 0).unwrap();
        assert_ne!(first.key, second.key);
    }

    #[test]
    fn sticky_cache_memoises_round_robin_pick(){
        let c = cluster(
            &[
                ("a", "10.0.0.1:80"),
                ("b", "10.0.0.2:80"),
                ("c", "10.0.0.3:80"),
            ],
            true,
        );
        let now = Instant::now();
        let first = c.pick(now, 777).unwrap();
        for _ in 0..5 {
            assert_eq!(c.pick(now, 777).unwrap().key, first.key);
        }
    }

    #[test]
    fn fade_survives_rediscovery() {
        let c = cluster(&[("a", "10.0.0.1:80"), ("b", "10.0.0.2:80")], false);
        let now = Instant::now();
        let member = c.pick(now, 0).unwrap();
        member.failure.set_fade(true);

        // zeroconf re-announce of the same key/address
        c.on_new(&member.key, member.address);
        let again = {
            let members = c.members.lock().unwrap();
            members.get(&member.key).unwrap().clone()
        };
        assert!(again.failure.is_fading());
    }

    #[test]
    fn retries_scale_with_cluster_size() {
        assert_eq!(calculate_retries(1), 0);
        assert_eq!(calculate_retries(2), 1);
        assert_eq!(calculate_retries(3), 2);
        assert_eq!(calculate_retries(10), 3);
    }
}
