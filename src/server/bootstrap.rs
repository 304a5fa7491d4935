use super::handler::ProxyHandler;
use super::state::Instance;
use crate::cache::rubber;
use crate::config;
use crate::control::{ControlDeps, ControlServer};
use crate::http1::server::{serve_connection, ServerTimeouts};
use crate::http2::{serve_h2, TlsByteStream};
use crate::session;
use crate::socket::FilteredSocket;
use crate::tls::{CertCache, FileCertDatabase};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct BootstrapArgs {
    pub config_path: PathBuf,
}

/// Process entry point: build the `Instance`, start the periodic
/// maintenance tasks and the control channel, then accept connections
/// on every configured listener until interrupted.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::load(&args.config_path)?;
    if config.listeners.is_empty() {
        anyhow::bail!("no listeners configured");
    }
    let instance = Instance::new(config)?;
    info!("bootstrap: instance ready");

    // periodic maintenance
    session::spawn_timers(
        instance.session_manager.clone(),
        instance.config.session.cleanup_interval,
        instance.config.session.save_path.clone(),
    );
    rubber::spawn_compress_timer(
        instance.http_cache.rubber.clone(),
        Duration::from_secs(600),
    );

    if let Some(bind) = instance.config.control.bind {
        let control = ControlServer::bind(
            bind,
            ControlDeps {
                translation_cache: instance.translation_cache.clone(),
                http_cache: instance.http_cache.clone(),
                failure_manager: instance.failure_manager.clone(),
                session_manager: instance.session_manager.clone(),
                stats: instance.stats.clone(),
            },
        )
        .await?;
        tokio::spawn(control.run());
    }

    let handler = Arc::new(ProxyHandler {
        instance: instance.clone(),
    });

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    for listener in instance.config.listeners.clone() {
        let handler = handler.clone();
        let instance = instance.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_listener(listener, instance, handler, shutdown).await {
                error!("listener failed: {}", e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("bootstrap: shutting down");
    shutdown.cancel();
    if let Some(path) = &instance.config.session.save_path {
        if let Err(e) = instance.session_manager.save_to(path) {
            warn!("bootstrap: final session snapshot failed: {}", e);
        }
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn run_listener(
    listener_config: config::ListenerConfig,
    instance: Arc<Instance>,
    handler: Arc<ProxyHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listener_config.address)
        .await
        .with_context(|| format!("cannot bind {}", listener_config.address))?;
    info!(
        "listener: accepting on {}{}",
        listener_config.address,
        if listener_config.tls.is_some() {
            " (tls)"
        } else {
            ""
        }
    );

    let tls_config = match &listener_config.tls {
        Some(tls) => Some(build_tls_config(tls)?),
        None => None,
    };

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => {
                info!("listener: {} stopping", listener_config.address);
                return Ok(());
            }
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("listener: accept failed: {}", e);
                continue;
            }
        };
        instance.stats.connection_opened();
        metrics::counter!("proxy_connections_total").increment(1);

        let handler = handler.clone();
        match &tls_config {
            None => {
                tokio::spawn(async move {
                    let socket = FilteredSocket::new_tcp(stream);
                    let score = serve_connection(
                        socket,
                        peer_addr,
                        false,
                        handler,
                        ServerTimeouts::default(),
                    )
                    .await;
                    metrics::histogram!("proxy_connection_score").record(score as f64);
                });
            }
            Some(tls_config) => {
                let tls_config = tls_config.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_tls(stream, peer_addr, tls_config, handler).await {
                        tracing::debug!("listener: TLS connection from {}: {}", peer_addr, e);
                    }
                });
            }
        }
    }
}

/// Terminate TLS, then pick HTTP/2 or HTTP/1.1 by the negotiated ALPN
/// protocol.
async fn serve_tls(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    handler: Arc<ProxyHandler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conn = rustls::ServerConnection::new(tls_config)?;
    let mut tls = TlsByteStream::new(stream, conn);
    tls.handshake().await?;

    if tls.alpn_protocol() == Some(b"h2") {
        serve_h2(tls, peer_addr, true, handler).await
    } else {
        let socket = FilteredSocket::new(
            crate::socket::SocketStream::Boxed(Box::new(tls)),
            None,
        );
        serve_connection(socket, peer_addr, true, handler, ServerTimeouts::default()).await;
        Ok(())
    }
}

fn build_tls_config(tls: &config::ListenerTlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    let db = Arc::new(FileCertDatabase::new(tls.cert_db_dir.clone()));
    let cert_cache = match &tls.ca_file {
        Some(ca_file) => {
            let ca_pem = std::fs::read(ca_file)
                .with_context(|| format!("cannot read CA bundle {}", ca_file.display()))?;
            CertCache::with_ca_pool(db, &ca_pem)
        }
        None => CertCache::new(db),
    };

    // TTL sweep for cached certificate contexts
    {
        let cert_cache = cert_cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                cert_cache.sweep();
            }
        });
    }

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_cache);
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(server_config))
}
