use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long an unused certificate context stays cached.
const CERT_TTL: Duration = Duration::from_secs(24 * 3600);

/// External certificate storage, looked up by exact host name.
pub trait CertDatabase: Send + Sync {
    fn lookup(&self, host: &str) -> std::io::Result<Option<PemEntry>>;
}

pub struct PemEntry {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Certificates as `<dir>/<host>.crt` + `<dir>/<host>.key`; wildcard
/// entries use `_` for the leading label (`_.example.com.crt`).
pub struct FileCertDatabase {
    dir: PathBuf,
}

impl FileCertDatabase {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl CertDatabase for FileCertDatabase {
    fn lookup(&self, host: &str) -> std::io::Result<Option<PemEntry>> {
        let stem = host.replace('*', "_");
        let cert_path = self.dir.join(format!("{}.crt", stem));
        let key_path = self.dir.join(format!("{}.key", stem));
        let cert_pem = match std::fs::read(&cert_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let key_pem = std::fs::read(&key_path)?;
        Ok(Some(PemEntry { cert_pem, key_pem }))
    }
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    last_use: Mutex<Instant>,
}

/// Per-SNI certificate cache: canonical host keys, single-label wildcard
/// fallback, issuer-chain completion from a preloaded CA pool, 24 h TTL
/// from last use. Plugs into rustls as the server's certificate
/// resolver.
pub struct CertCache {
    db: Arc<dyn CertDatabase>,
    entries: DashMap<String, Arc<CachedCert>>,
    /// CA certificates indexed by a digest of their subject name
    ca_pool: Vec<(u64, CertificateDer<'static>)>,
}

impl CertCache {
    pub fn new(db: Arc<dyn CertDatabase>) -> Arc<Self> {
        Arc::new(Self {
            db,
            entries: DashMap::new(),
            ca_pool: Vec::new(),
        })
    }

    /// Preload issuer certificates used to complete chains.
    pub fn with_ca_pool(db: Arc<dyn CertDatabase>, ca_pem: &[u8]) -> Arc<Self> {
        let mut ca_pool = Vec::new();
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]).flatten() {
            if let Some(subject) = der::subject_digest(&cert) {
                ca_pool.push((subject, cert));
            }
        }
        Arc::new(Self {
            db,
            entries: DashMap::new(),
            ca_pool,
        })
    }

    fn canonical_host(host: &str) -> String {
        let host = host.trim_end_matches('.');
        let host = host.split(':').next().unwrap_or(host);
        host.to_ascii_lowercase()
    }

    /// `a.example.com` → `*.example.com`; one label only, so
    /// `b.a.example.com` does not match `*.example.com`.
    fn wildcard_of(host: &str) -> Option<String> {
        let (_, rest) = host.split_once('.')?;
        if rest.is_empty() || !rest.contains('.') {
            return None;
        }
        Some(format!("*.{}", rest))
    }

    pub fn lookup(&self, raw_host: &str) -> Option<Arc<CertifiedKey>> {
        let host = Self::canonical_host(raw_host);

        if let Some(hit) = self.get_cached(&host) {
            return Some(hit);
        }
        if let Some(key) = self.load(&host) {
            return Some(key);
        }

        // wildcard fallback
        let wildcard = Self::wildcard_of(&host)?;
        if let Some(hit) = self.get_cached(&wildcard) {
            return Some(hit);
        }
        self.load(&wildcard)
    }

    fn get_cached(&self, key: &str) -> Option<Arc<CertifiedKey>> {
        let entry = self.entries.get(key)?;
        let mut last_use = entry.last_use.lock().unwrap();
        if last_use.elapsed() > CERT_TTL {
            drop(last_use);
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        *last_use = Instant::now();
        Some(entry.key.clone())
    }

    fn load(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let pem = match self.db.lookup(host) {
            Ok(Some(pem)) => pem,
            Ok(None) => return None,
            Err(e) => {
                warn!("certs: database lookup for '{}' failed: {}", host, e);
                return None;
            }
        };
        let key = match self.build_certified_key(&pem) {
            Ok(key) => Arc::new(key),
            Err(e) => {
                warn!("certs: cannot use certificate for '{}': {}", host, e);
                return None;
            }
        };
        debug!("certs: loaded certificate for '{}'", host);
        self.entries.insert(
            host.to_string(),
            Arc::new(CachedCert {
                key: key.clone(),
                last_use: Mutex::new(Instant::now()),
            }),
        );
        Some(key)
    }

    fn build_certified_key(&self, pem: &PemEntry) -> Result<CertifiedKey, String> {
        let mut chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &pem.cert_pem[..])
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?;
        if chain.is_empty() {
            return Err("no certificate in PEM".into());
        }

        // complete the issuer chain from the CA pool: follow
        // issuer-name digests until self-signed or unknown
        let mut tail = chain.last().unwrap().clone();
        for _ in 0..4 {
            let Some(issuer_digest) = der::issuer_digest(&tail) else {
                break;
            };
            if der::subject_digest(&tail) == Some(issuer_digest) {
                break; // self-signed
            }
            let Some((_, issuer)) = self
                .ca_pool
                .iter()
                .find(|(subject, _)| *subject == issuer_digest)
            else {
                break;
            };
            chain.push(issuer.clone());
            tail = issuer.clone();
        }

        let key_der: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut &pem.key_pem[..])
                .map_err(|e| e.to_string())?
                .ok_or("no private key in PEM")?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| e.to_string())?;
        Ok(CertifiedKey::new(chain, signing_key))
    }

    /// Change-feed hook: a certificate was modified, drop it at once.
    pub fn invalidate_host(&self, raw_host: &str) {
        let host = Self::canonical_host(raw_host);
        self.entries.remove(&host);
        if let Some(wildcard) = Self::wildcard_of(&host) {
            self.entries.remove(&wildcard);
        }
    }

    /// Periodic sweep dropping contexts unused past their TTL.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_use.lock().unwrap().elapsed() <= CERT_TTL);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("certs: swept {} expired contexts", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl rustls::server::ResolvesServerCert for CertCache {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.lookup(server_name)
    }
}

/// Just enough DER navigation to digest the issuer and subject name of
/// an X.509 certificate, for chain assembly.
mod der {
    use rustls::pki_types::CertificateDer;

    /// Read one TLV; returns (header_len, content_len).
    fn tlv(data: &[u8]) -> Option<(usize, usize)> {
        if data.len() < 2 {
            return None;
        }
        let first_len = data[1] as usize;
        if first_len < 0x80 {
            return Some((2, first_len));
        }
        let n = first_len & 0x7f;
        if n == 0 || n > 4 || data.len() < 2 + n {
            return None;
        }
        let mut len = 0usize;
        for &b in &data[2..2 + n] {
            len = (len << 8) | b as usize;
        }
        Some((2 + n, len))
    }

    /// The raw TLV bytes of the issuer (`index == 0`) or subject
    /// (`index == 1`) name.
    fn name_tlv(cert: &CertificateDer<'_>, want_subject: bool) -> Option<Vec<u8>> {
        let data: &[u8] = cert.as_ref();
        // Certificate ::= SEQUENCE { tbsCertificate, … }
        let (h, _) = tlv(data)?;
        let tbs = &data[h..];
        let (h2, l2) = tlv(tbs)?;
        let mut fields = &tbs[h2..h2 + l2.min(tbs.len() - h2)];

        // optional [0] version
        if fields.first() == Some(&0xa0) {
            let (h, l) = tlv(fields)?;
            fields = &fields[h + l..];
        }
        // serialNumber, signature AlgorithmIdentifier
        for _ in 0..2 {
            let (h, l) = tlv(fields)?;
            fields = &fields[h + l..];
        }
        // issuer Name
        let (h, l) = tlv(fields)?;
        let issuer = &fields[..h + l];
        if !want_subject {
            return Some(issuer.to_vec());
        }
        fields = &fields[h + l..];
        // validity
        let (h, l) = tlv(fields)?;
        fields = &fields[h + l..];
        // subject Name
        let (h, l) = tlv(fields)?;
        Some(fields[..h + l].to_vec())
    }

    pub fn subject_digest(cert: &CertificateDer<'_>) -> Option<u64> {
        name_tlv(cert, true).map(|tlv| twox_hash::XxHash64::oneshot(0, &tlv))
    }

    pub fn issuer_digest(cert: &CertificateDer<'_>) -> Option<u64> {
        name_tlv(cert, false).map(|tlv| twox_hash::XxHash64::oneshot(0, &tlv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapDatabase {
        entries: HashMap<String, (Vec<u8>, Vec<u8>)>,
        hits: std::sync::atomic::AtomicUsize,
    }

    impl CertDatabase for MapDatabase {
        fn lookup(&self, host: &str) -> std::io::Result<Option<PemEntry>> {
            self.hits
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.entries.get(host).map(|(cert_pem, key_pem)| PemEntry {
                cert_pem: cert_pem.clone(),
                key_pem: key_pem.clone(),
            }))
        }
    }

    #[test]
    fn canonicalisation() {
        assert_eq!(CertCache::canonical_host("WWW.Example.COM."), "www.example.com");
        assert_eq!(CertCache::canonical_host("host:443"), "host");
    }

    #[test]
    fn wildcard_single_label() {
        assert_eq!(
            CertCache::wildcard_of("a.example.com").as_deref(),
            Some("*.example.com")
        );
        // one more level down must NOT collapse to *.example.com
        assert_eq!(
            CertCache::wildcard_of("b.a.example.com").as_deref(),
            Some("*.a.example.com")
        );
        assert_eq!(CertCache::wildcard_of("example.com"), None);
        assert_eq!(CertCache::wildcard_of("localhost"), None);
    }

    #[test]
    fn unknown_host_yields_none() {
        let db = Arc::new(MapDatabase {
            entries: HashMap::new(),
            hits: Default::default(),
        });
        let cache = CertCache::new(db);
        assert!(cache.lookup("unknown.example.com").is_none());
    }
}
