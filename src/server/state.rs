use crate::access_log::AccessLogger;
use crate::cache::{CachingResourceLoader, HttpCache, HttpCacheConfig};
use crate::cluster::{Cluster, FailureManager};
use crate::config::Config;
use crate::istream::PipeStock;
use crate::resource::child::ChildStock;
use crate::resource::file::NfsReadCache;
use crate::resource::http::HttpStock;
use crate::resource::DirectResourceLoader;
use crate::session::SessionManager;
use crate::stats::ProxyStats;
use crate::translation::{TranslationCache, TranslationStock};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// The top-level object owning every process-scoped resource: caches,
/// stocks, the failure manager, the session manager. Components receive
/// references at construction; there are no process-wide statics.
pub struct Instance {
    pub config: Config,
    pub stats: Arc<ProxyStats>,
    pub failure_manager: Arc<FailureManager>,
    pub cluster: Arc<Cluster>,
    pub session_manager: Arc<SessionManager>,
    pub pipe_stock: Arc<PipeStock>,
    pub http_cache: Arc<HttpCache>,
    pub translation_cache: Arc<TranslationCache>,
    pub loader: Arc<CachingResourceLoader<DirectResourceLoader>>,
    pub access_logger: Arc<AccessLogger>,
}

impl Instance {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let stats = Arc::new(ProxyStats::default());
        let failure_manager = Arc::new(FailureManager::new());

        let cluster = Arc::new(Cluster::new(
            config.cluster.name.clone(),
            failure_manager.clone(),
            config.cluster.sticky_cache,
        ));
        for member in &config.cluster.members {
            cluster.on_new(&member.key, member.address);
        }

        let session_manager = SessionManager::new(
            config.session.idle_timeout,
            config.session.cluster_size,
            config.session.cluster_node,
        );
        if let Some(path) = &config.session.save_path {
            match session_manager.load_from(path) {
                Ok(n) if n > 0 => info!("instance: restored {} sessions", n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => info!("instance: session snapshot not loaded: {}", e),
            }
        }

        let http_cache = HttpCache::new(HttpCacheConfig {
            size: config.cache.size,
            cacheable_size_limit: config.cache.cacheable_size_limit,
            obey_no_cache: config.cache.obey_no_cache,
            ..Default::default()
        });

        let translation_cache = TranslationCache::new(
            TranslationStock::new(
                config.translation.socket_path.clone(),
                config.translation.connections,
            ),
            config.translation.cache_size,
        );

        let direct = Arc::new(DirectResourceLoader {
            http_stock: Arc::new(HttpStock::new(failure_manager.clone(), 16)),
            child_stock: Arc::new(ChildStock::new(
                config.spawn.socket_dir.clone(),
                config.spawn.children_per_key,
            )),
            nfs_cache: Arc::new(NfsReadCache::new(
                config.nfs.mount_base.clone(),
                config.nfs.cache_entries,
            )),
        });
        let loader = Arc::new(CachingResourceLoader::new(http_cache.clone(), direct));

        let access_logger = match &config.access_log.command {
            Some(command) => Arc::new(AccessLogger::spawn(
                command,
                &config.access_log.args,
                config.access_log.uid,
                config.access_log.gid,
            )?),
            None => Arc::new(AccessLogger::Tracing),
        };

        Ok(Arc::new(Self {
            stats,
            failure_manager,
            cluster,
            session_manager,
            pipe_stock: PipeStock::new(64),
            http_cache,
            translation_cache,
            loader,
            access_logger,
            config,
        }))
    }
}
