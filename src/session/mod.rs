use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_SESSIONS: usize = 65536;

/// Sessions purged per `purge()` sweep, at most.
const PURGE_BATCH: usize = 256;

/// 128-bit session identifier. The top bits may encode the cluster node
/// so a stateless front-end can route stickily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u128);

impl SessionId {
    fn generate(prng: &mut StdRng) -> Self {
        let mut bytes = [0u8; 16];
        prng.fill_bytes(&mut bytes);
        SessionId(u128::from_be_bytes(bytes))
    }

    /// Replace the top bits so that `id % cluster_size == cluster_node`.
    fn set_cluster_node(&mut self, cluster_size: u32, cluster_node: u32) {
        debug_assert!(cluster_size > 0 && cluster_node < cluster_size);
        let remainder = (self.0 % cluster_size as u128) as u32;
        let shift = cluster_node as i64 - remainder as i64;
        self.0 = self.0.wrapping_add_signed(shift as i128);
    }

    pub fn cluster_node(&self, cluster_size: u32) -> u32 {
        (self.0 % cluster_size as u128) as u32
    }

    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(SessionId)
    }
}

/// Per-realm slice of a session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RealmSession {
    pub site: Option<String>,
    pub user: Option<String>,
    /// widget state by id path
    pub widgets: HashMap<String, WidgetSession>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WidgetSession {
    pub path_info: Option<String>,
    pub query_string: Option<String>,
}

pub struct Session {
    pub id: SessionId,
    pub csrf_salt: SessionId,
    /// refreshed on every touch
    expires: Instant,
    /// how often this session was found
    pub counter: u64,
    created: Instant,
    pub realms: HashMap<String, RealmSession>,
    pub attach: Option<Vec<u8>>,
}

impl Session {
    fn new(id: SessionId, csrf_salt: SessionId, idle_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            csrf_salt,
            expires: now + idle_timeout,
            counter: 0,
            created: now,
            realms: HashMap::new(),
            attach: None,
        }
    }

    pub fn realm(&mut self, name: &str) -> &mut RealmSession {
        self.realms.entry(name.to_string()).or_default()
    }

    /// Older and idler sessions score higher and are purged first.
    fn purge_score(&self, now: Instant) -> u64 {
        let age = now.duration_since(self.created).as_secs();
        let visits = self.counter.min(1000);
        age.saturating_sub(visits * 10)
    }
}

/// Guards a session against eviction for the duration of a request.
pub struct SessionLease {
    session: Arc<Mutex<Session>>,
}

impl SessionLease {
    pub fn id(&self) -> SessionId {
        self.session.lock().unwrap().id
    }

    /// A second lease on the same session, e.g. for a nested processing
    /// run.
    pub fn clone_ref(&self) -> SessionLease {
        SessionLease {
            session: self.session.clone(),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.session.lock().unwrap())
    }
}

struct ManagerInner {
    sessions: HashMap<SessionId, Arc<Mutex<Session>>>,
    by_attach: HashMap<Vec<u8>, SessionId>,
    prng: StdRng,
}

/// Bounded in-memory session store with score-based purge and periodic
/// TTL cleanup.
pub struct SessionManager {
    inner: Mutex<ManagerInner>,
    idle_timeout: Duration,
    cluster_size: u32,
    cluster_node: u32,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration, cluster_size: u32, cluster_node: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManagerInner {
                sessions: HashMap::new(),
                by_attach: HashMap::new(),
                prng: StdRng::from_entropy(),
            }),
            idle_timeout,
            cluster_size,
            cluster_node,
        })
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    fn generate_id(&self, prng: &mut StdRng) -> SessionId {
        let mut id = SessionId::generate(prng);
        if self.cluster_size > 0 {
            id.set_cluster_node(self.cluster_size, self.cluster_node);
        }
        id
    }

    pub fn create_session(&self) -> SessionLease {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.len() >= MAX_SESSIONS {
            Self::purge(&mut inner);
        }

        let csrf_salt = SessionId::generate(&mut inner.prng);
        let id = loop {
            let id = self.generate_id(&mut inner.prng);
            if !inner.sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(Mutex::new(Session::new(id, csrf_salt, self.idle_timeout)));
        inner.sessions.insert(id, session.clone());
        metrics::gauge!("proxy_sessions").set(inner.sessions.len() as f64);
        SessionLease { session }
    }

    /// Find a live session, refreshing its expiry.
    pub fn find(&self, id: SessionId) -> Option<SessionLease> {
        let inner = self.inner.lock().unwrap();
        let session = inner.sessions.get(&id)?.clone();
        drop(inner);
        {
            let mut s = session.lock().unwrap();
            s.expires = Instant::now() + self.idle_timeout;
            s.counter += 1;
        }
        Some(SessionLease { session })
    }

    /// Bind a session to an opaque attach blob: requests presenting the
    /// same blob resolve to the same session even without a cookie.
    pub fn attach(&self, lease: Option<SessionLease>, attach: Vec<u8>) -> SessionLease {
        assert!(!attach.is_empty());
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing_id) = inner.by_attach.get(&attach).copied() {
            if let Some(existing) = inner.sessions.get(&existing_id).cloned() {
                if let Some(lease) = lease {
                    let old_id = lease.id();
                    if old_id != existing_id {
                        // merge: the presented session dissolves into
                        // the attached one
                        let old = inner.sessions.remove(&old_id);
                        if let Some(old) = old {
                            let old = old.lock().unwrap();
                            if let Some(old_blob) = &old.attach {
                                inner.by_attach.remove(old_blob);
                            }
                            let mut target = existing.lock().unwrap();
                            for (name, realm) in &old.realms {
                                target
                                    .realms
                                    .entry(name.clone())
                                    .or_insert_with(|| realm.clone());
                            }
                        }
                    }
                }
                return SessionLease { session: existing };
            }
            inner.by_attach.remove(&attach);
        }

        let lease = match lease {
            Some(lease) => lease,
            None => {
                drop(inner);
                let lease = self.create_session();
                inner = self.inner.lock().unwrap();
                lease
            }
        };
        {
            let mut session = lease.session.lock().unwrap();
            if let Some(old_blob) = session.attach.take() {
                inner.by_attach.remove(&old_blob);
            }
            session.attach = Some(attach.clone());
        }
        inner.by_attach.insert(attach, lease.id());
        lease
    }

    pub fn discard(&self, id: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.remove(&id) {
            if let Some(blob) = &session.lock().unwrap().attach {
                inner.by_attach.remove(blob);
            }
        }
    }

    /// Evict up to `PURGE_BATCH` of the highest-scoring sessions. When
    /// the winning score bucket is very small, one recursive pass avoids
    /// running this expensive scan again immediately.
    fn purge(inner: &mut ManagerInner) {
        let now = Instant::now();
        let mut highest_score = 0u64;
        let mut victims: Vec<SessionId> = Vec::new();

        for (id, session) in &inner.sessions {
            let score = session.lock().unwrap().purge_score(now);
            if score > highest_score {
                highest_score = score;
                victims.clear();
            }
            if score == highest_score && victims.len() < PURGE_BATCH {
                victims.push(*id);
            }
        }
        if victims.is_empty() {
            return;
        }

        info!(
            "session: purging {} sessions (score={})",
            victims.len(),
            highest_score
        );
        let few = victims.len() < 16;
        for id in victims {
            if let Some(session) = inner.sessions.remove(&id) {
                if let Some(blob) = &session.lock().unwrap().attach {
                    inner.by_attach.remove(blob);
                }
            }
        }

        if few && inner.sessions.len() > MAX_SESSIONS - PURGE_BATCH {
            Self::purge(inner);
        }
    }

    /// TTL sweep; also reseeds the id generator.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.sessions.len();
        let expired: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.lock().unwrap().expires <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(session) = inner.sessions.remove(&id) {
                if let Some(blob) = &session.lock().unwrap().attach {
                    inner.by_attach.remove(blob);
                }
            }
        }
        let dropped = before - inner.sessions.len();
        if dropped > 0 {
            debug!("session: cleanup dropped {} expired sessions", dropped);
        }

        // reseed here; the cleanup timer is a convenient hook
        inner.prng = StdRng::from_entropy();
    }

    /// Serialize all live sessions for the snapshot file.
    fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        SessionSnapshot {
            sessions: inner
                .sessions
                .values()
                .filter_map(|session| {
                    let s = session.lock().unwrap();
                    if s.expires <= now {
                        return None;
                    }
                    Some(SessionRecord {
                        id: s.id,
                        csrf_salt: s.csrf_salt,
                        counter: s.counter,
                        expires_in_secs: s.expires.duration_since(now).as_secs(),
                        realms: s.realms.clone(),
                        attach: s
                            .attach
                            .as_ref()
                            .map(|b| {
                                use base64::Engine;
                                base64::engine::general_purpose::STANDARD.encode(b)
                            }),
                    })
                })
                .collect(),
        }
    }

    /// Write the snapshot, replace-on-write.
    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec(&snapshot)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        debug!(
            "session: saved {} sessions to {}",
            snapshot.sessions.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load_from(&self, path: &std::path::Path) -> std::io::Result<usize> {
        let data = std::fs::read(path)?;
        let snapshot: SessionSnapshot = serde_json::from_slice(&data)?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut loaded = 0;
        for record in snapshot.sessions {
            if inner.sessions.len() >= MAX_SESSIONS {
                break;
            }
            let attach = record.attach.as_ref().and_then(|b| {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.decode(b).ok()
            });
            let session = Session {
                id: record.id,
                csrf_salt: record.csrf_salt,
                expires: now + Duration::from_secs(record.expires_in_secs),
                counter: record.counter,
                created: now,
                realms: record.realms,
                attach: attach.clone(),
            };
            if let Some(blob) = attach {
                inner.by_attach.insert(blob, record.id);
            }
            inner
                .sessions
                .insert(record.id, Arc::new(Mutex::new(session)));
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn random_u64(&self) -> u64 {
        self.inner.lock().unwrap().prng.gen()
    }
}

#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    sessions: Vec<SessionRecord>,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    id: SessionId,
    csrf_salt: SessionId,
    counter: u64,
    expires_in_secs: u64,
    realms: HashMap<String, RealmSession>,
    attach: Option<String>,
}

/// Periodic TTL cleanup plus snapshotting.
pub fn spawn_timers(
    manager: Arc<SessionManager>,
    cleanup_interval: Duration,
    save_path: Option<std::path::PathBuf>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut cleanup = tokio::time::interval(cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut save = tokio::time::interval(Duration::from_secs(120));
        save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cleanup.tick() => manager.cleanup(),
                _ = save.tick() => {
                    if let Some(path) = &save_path {
                        if let Err(e) = manager.save_to(path) {
                            warn!("session: snapshot failed: {}", e);
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        SessionManager::new(Duration::from_secs(60), 0, 0)
    }

    #[test]
    fn ids_are_unique() {
        let m = manager();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let lease = m.create_session();
            assert!(seen.insert(lease.id()), "duplicate session id");
        }
        assert_eq!(m.count(), 1000);
    }

    #[test]
    fn find_touches_counter() {
        let m = manager();
        let id = m.create_session().id();
        let lease = m.find(id).unwrap();
        assert_eq!(lease.with(|s| s.counter), 1);
        let lease = m.find(id).unwrap();
        assert_eq!(lease.with(|s| s.counter), 2);
        assert!(m.find(SessionId(42)).is_none());
    }

    #[test]
    fn cluster_node_encoding() {
        let m = SessionManager::new(Duration::from_secs(60), 8, 5);
        for _ in 0..64 {
            let lease = m.create_session();
            assert_eq!(lease.id().cluster_node(8), 5);
        }
    }

    #[test]
    fn id_hex_round_trip() {
        let m = manager();
        let id = m.create_session().id();
        assert_eq!(SessionId::parse(&id.to_hex()), Some(id));
        assert_eq!(SessionId::parse("xyz"), None);
    }

    #[test]
    fn attach_resolves_to_same_session() {
        let m = manager();
        let first = m.attach(None, b"user-42".to_vec());
        let again = m.attach(None, b"user-42".to_vec());
        assert_eq!(first.id(), again.id());

        let other = m.attach(None, b"user-43".to_vec());
        assert_ne!(first.id(), other.id());
    }

    #[test]
    fn attach_merges_presented_session() {
        let m = manager();
        let original = m.attach(None, b"blob".to_vec());

        let newcomer = m.create_session();
        newcomer.with(|s| {
            s.realm("r").user = Some("alice".into());
        });
        let newcomer_id = newcomer.id();

        let merged = m.attach(Some(newcomer), b"blob".to_vec());
        assert_eq!(merged.id(), original.id());
        assert_eq!(merged.with(|s| s.realm("r").user.clone()), Some("alice".into()));
        // the presented session is gone
        assert!(m.find(newcomer_id).is_none());
    }

    #[test]
    fn purge_keeps_capacity_bounded() {
        let m = manager();
        let mut inner = m.inner.lock().unwrap();
        let now = Instant::now();
        for i in 0..MAX_SESSIONS {
            let csrf = SessionId(1);
            let id = SessionId(i as u128 + 1000);
            let mut s = Session::new(id, csrf, Duration::from_secs(60));
            // spread ages so scores differ
            s.created = now
                .checked_sub(Duration::from_secs((i % 512) as u64))
                .unwrap_or(now);
            inner.sessions.insert(id, Arc::new(Mutex::new(s)));
        }
        drop(inner);

        let before = m.count();
        assert_eq!(before, MAX_SESSIONS);
        let lease = m.create_session();
        let after = m.count();
        assert!(after <= MAX_SESSIONS, "purge must make room");
        assert!(before - (after - 1) <= PURGE_BATCH * 2);
        assert!(m.find(lease.id()).is_some());
    }

    #[test]
    fn cleanup_drops_expired() {
        let m = SessionManager::new(Duration::from_millis(0), 0, 0);
        let id = m.create_session().id();
        std::thread::sleep(Duration::from_millis(5));
        m.cleanup();
        assert_eq!(m.count(), 0);
        assert!(m.find(id).is_none());
    }

    #[test]
    fn snapshot_round_trip() {
        let m = manager();
        let lease = m.attach(None, b"attached".to_vec());
        lease.with(|s| {
            s.realm("site").user = Some("bob".into());
        });
        let id = lease.id();

        let path = std::env::temp_dir().join(format!("trellis-sessions-{}.json", std::process::id()));
        m.save_to(&path).unwrap();

        let restored = SessionManager::new(Duration::from_secs(60), 0, 0);
        let loaded = restored.load_from(&path).unwrap();
        assert_eq!(loaded, 1);
        let lease = restored.find(id).unwrap();
        assert_eq!(lease.with(|s| s.realm("site").user.clone()), Some("bob".into()));

        // attach index was rebuilt
        let by_attach = restored.attach(None, b"attached".to_vec());
        assert_eq!(by_attach.id(), id);

        std::fs::remove_file(&path).ok();
    }
}
