use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub nfs: NfsConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    /// TLS termination for this listener
    pub tls: Option<ListenerTlsConfig>,
    /// alternative Host value accepted for authentication callbacks
    pub auth_alt_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerTlsConfig {
    /// directory of per-host `<name>.crt` / `<name>.key` files
    pub cert_db_dir: PathBuf,
    /// PEM bundle of issuer certificates for chain completion
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationConfig {
    pub socket_path: String,
    #[serde(default = "default_translation_connections")]
    pub connections: usize,
    #[serde(default = "default_translation_cache_size")]
    pub cache_size: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/translation.sock".into(),
            connections: default_translation_connections(),
            cache_size: default_translation_cache_size(),
        }
    }
}

fn default_translation_connections() -> usize {
    4
}

fn default_translation_cache_size() -> usize {
    65536
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// use the LRU sticky cache instead of consistent hashing
    #[serde(default)]
    pub sticky_cache: bool,
    /// static members; zeroconf discovery adds and removes more at
    /// runtime
    #[serde(default)]
    pub members: Vec<ClusterMemberConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            sticky_cache: false,
            members: Vec::new(),
        }
    }
}

fn default_cluster_name() -> String {
    "default".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterMemberConfig {
    pub key: String,
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// rubber arena bytes for response bodies
    #[serde(default = "default_cache_size")]
    pub size: usize,
    #[serde(default = "default_cacheable_size_limit")]
    pub cacheable_size_limit: u64,
    #[serde(default = "default_true")]
    pub obey_no_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            cacheable_size_limit: default_cacheable_size_limit(),
            obey_no_cache: true,
        }
    }
}

fn default_cache_size() -> usize {
    64 * 1024 * 1024
}

fn default_cacheable_size_limit() -> u64 {
    512 * 1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// e.g. "30m"
    #[serde(default = "default_session_idle", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(default)]
    pub cluster_size: u32,
    #[serde(default)]
    pub cluster_node: u32,
    pub save_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_session_idle(),
            cleanup_interval: default_cleanup_interval(),
            cluster_size: 0,
            cluster_node: 0,
            save_path: None,
        }
    }
}

fn default_session_idle() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// serde adapter for humantime duration strings.
mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    pub bind: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AccessLogConfig {
    /// child logger command; absent logs through tracing
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NfsConfig {
    #[serde(default = "default_nfs_mount_base")]
    pub mount_base: PathBuf,
    #[serde(default = "default_nfs_cache_entries")]
    pub cache_entries: usize,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            mount_base: default_nfs_mount_base(),
            cache_entries: default_nfs_cache_entries(),
        }
    }
}

fn default_nfs_mount_base() -> PathBuf {
    "/mnt/nfs".into()
}

fn default_nfs_cache_entries() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnConfig {
    /// directory for child listener sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_children_per_key")]
    pub children_per_key: usize,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            children_per_key: default_children_per_key(),
        }
    }
}

fn default_socket_dir() -> PathBuf {
    "/run/trellis/children".into()
}

fn default_children_per_key() -> usize {
    4
}
