use std::hash::Hasher;
use std::net::SocketAddr;

/// Virtual nodes per member. More points smooth the distribution at the
/// cost of ring size.
const REPLICAS_PER_MEMBER: usize = 64;

/// Consistent-hash ring over cluster members. Built eagerly from the
/// member list; lookups are a binary search over the sorted point list.
pub struct HashRing {
    /// (point, index into the member list this ring was built from)
    points: Vec<(u64, usize)>,
}

fn hash_point(address: &SocketAddr, replica: usize) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(replica as u64);
    match address.ip() {
        std::net::IpAddr::V4(ip) => hasher.write(&ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.write(&ip.octets()),
    }
    hasher.write_u16(address.port());
    hasher.finish()
}

impl HashRing {
    pub fn build(addresses: impl Iterator<Item = SocketAddr>) -> Self {
        let mut points = Vec::new();
        for (index, address) in addresses.enumerate() {
            for replica in 0..REPLICAS_PER_MEMBER {
                points.push((hash_point(&address, replica), index));
            }
        }
        points.sort_unstable();
        points.dedup_by_key(|(p, _)| *p);
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The member owning `hash`: the first ring point at or after it,
    /// wrapping around.
    pub fn pick(&self, hash: u64) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let i = self.points.partition_point(|(p, _)| *p < hash);
        let (_, index) = self.points[i % self.points.len()];
        Some(index)
    }

    /// Walk forward: the next ring point strictly after `hash`, returned
    /// with its point value so the caller can keep walking.
    pub fn find_next(&self, hash: u64) -> Option<(u64, usize)> {
        if self.points.is_empty() {
            return None;
        }
        let i = self.points.partition_point(|(p, _)| *p <= hash);
        Some(self.points[i % self.points.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("10.0.0.{}:8080", i + 1).parse().unwrap())
            .collect()
    }

    #[test]
    fn pick_is_deterministic() {
        let ring = HashRing::build(addrs(3).into_iter());
        for hash in [0u64, 1, 42, u64::MAX / 2, u64::MAX] {
            assert_eq!(ring.pick(hash), ring.pick(hash));
        }
    }

    #[test]
    fn removing_an_unrelated_member_rarely_moves_keys() {
        let three = HashRing::build(addrs(3).into_iter());
        let two = HashRing::build(addrs(2).into_iter());

        // keys owned by members 0/1 in the 3-ring should mostly stay put
        let mut moved = 0;
        let mut kept = 0;
        for hash in (0..10_000u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)) {
            let a = three.pick(hash).unwrap();
            if a < 2 {
                if two.pick(hash).unwrap() == a {
                    kept += 1;
                } else {
                    moved += 1;
                }
            }
        }
        assert!(kept > moved * 5, "kept={} moved={}", kept, moved);
    }

    #[test]
    fn walk_forward_visits_other_members() {
        let ring = HashRing::build(addrs(3).into_iter());
        let hash = 42;
        let first = ring.pick(hash).unwrap();
        let mut h = hash;
        let mut seen = std::collections::HashSet::from([first]);
        for _ in 0..1000 {
            let (next_hash, index) = ring.find_next(h).unwrap();
            h = next_hash;
            seen.insert(index);
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn empty_ring() {
        let ring = HashRing::build(std::iter::empty());
        assert!(ring.is_empty());
        assert_eq!(ring.pick(1), None);
    }
}
