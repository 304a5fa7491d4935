use super::address::HttpAddress;
use crate::cluster::{calculate_retries, FailureManager, CONNECT_FAILURE_DURATION};
use crate::error::ProxyError;
use crate::http1::client::{send_request, ClientConnection, ClientRequest};
use crate::http1::HttpResponse;
use crate::istream::BoxIstream;
use crate::socket::{FilteredSocket, TlsClientFilter};
use crate::stock::{Stock, StockClass, StockError};
use http::{HeaderMap, HeaderValue, Method};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::debug;

/// A rustls verifier that accepts any upstream certificate. Backend TLS
/// here is for encryption of internal traffic; identity is managed by
/// the deployment, not by a public CA.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct HttpConnClass {
    tls_config: Arc<rustls::ClientConfig>,
}

impl StockClass for HttpConnClass {
    type Item = ClientConnection;

    fn create(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ClientConnection, StockError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            // key: "tcp|addr" or "tls|sni|addr"
            let mut parts = key.splitn(3, '|');
            let scheme = parts.next().unwrap_or("tcp");
            let (sni, addr) = if scheme == "tls" {
                (parts.next().unwrap_or(""), parts.next().unwrap_or(""))
            } else {
                ("", parts.next().unwrap_or(""))
            };
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| StockError::Create(std::io::Error::other("bad address key")))?;
            let stream = TcpStream::connect(addr).await.map_err(StockError::Create)?;
            let mut socket = FilteredSocket::new_tcp(stream);
            if scheme == "tls" {
                let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
                    .map_err(|_| {
                        StockError::Create(std::io::Error::other("bad SNI name"))
                    })?;
                let filter = TlsClientFilter::new(self.tls_config.clone(), server_name)
                    .map_err(|e| StockError::Create(std::io::Error::other(e.to_string())))?;
                socket.set_filter(Box::new(filter));
            }
            Ok(ClientConnection::new(socket))
        })
    }

    fn validate(&self, conn: &mut ClientConnection) -> bool {
        // an idle connection that saw a hangup or close_notify is dead
        !(conn.socket.saw_hangup() || conn.socket.peer_closed())
    }
}

/// Pooled backend HTTP connections, keyed by target address (+TLS name).
pub struct HttpStock {
    stock: Stock<HttpConnClass>,
    pub failure_manager: Arc<FailureManager>,
}

impl HttpStock {
    pub fn new(failure_manager: Arc<FailureManager>, limit_per_key: usize) -> Self {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        Self {
            stock: Stock::new(
                HttpConnClass {
                    tls_config: Arc::new(tls_config),
                },
                limit_per_key,
                limit_per_key,
            ),
            failure_manager,
        }
    }

    fn key_for(address: &HttpAddress, target: SocketAddr) -> String {
        if address.https {
            let sni = address
                .host_and_port
                .split(':')
                .next()
                .unwrap_or(&address.host_and_port);
            format!("tls|{}|{}", sni, target)
        } else {
            format!("tcp|{}", target)
        }
    }
}

/// Send an HTTP request to one of the address's targets, with
/// failure-aware target selection and bounded connect retries.
pub async fn send_http_request(
    stock: &HttpStock,
    address: &HttpAddress,
    sticky_hash: u64,
    method: Method,
    mut headers: HeaderMap,
    mut body: Option<BoxIstream>,
) -> Result<HttpResponse, ProxyError> {
    if address.addresses.is_empty() {
        return Err(ProxyError::Config(format!(
            "no addresses for {}",
            address.host_and_port
        )));
    }

    if let Ok(v) = HeaderValue::from_str(&address.host_and_port) {
        headers.insert(http::header::HOST, v);
    }

    let retries = calculate_retries(address.addresses.len());
    let mut tried: Vec<SocketAddr> = Vec::new();

    for attempt in 0..=retries {
        let now = Instant::now();
        let target = pick_target(stock, address, sticky_hash, &tried, now);
        let key = HttpStock::key_for(address, target);

        let lease = match stock.stock.get(&key).await {
            Ok(lease) => lease,
            Err(e) => {
                // connect failure: mark the member and try the next one
                stock
                    .failure_manager
                    .make(target)
                    .set_connect_failed(now, CONNECT_FAILURE_DURATION);
                metrics::counter!("proxy_cluster_connect_errors_total").increment(1);
                debug!(
                    "http: connect to {} failed (attempt {}/{}): {}",
                    target,
                    attempt + 1,
                    retries + 1,
                    e
                );
                tried.push(target);
                if attempt == retries {
                    return Err(ProxyError::ClusterEmpty);
                }
                continue;
            }
        };
        stock.failure_manager.make(target).unset_connect_failed();

        let (conn, ret) = lease.into_parts();
        let request = ClientRequest {
            method,
            uri: address.path.clone(),
            headers,
            body: body.take(),
        };
        let response = send_request(
            conn,
            request,
            Box::new(move |conn, reuse| {
                let delta = if reuse { 1 } else { -5 };
                ret.put(conn, reuse, delta);
            }),
        )
        .await?;
        return Ok(response);
    }
    Err(ProxyError::ClusterEmpty)
}

fn pick_target(
    stock: &HttpStock,
    address: &HttpAddress,
    sticky_hash: u64,
    tried: &[SocketAddr],
    now: Instant,
) -> SocketAddr {
    let candidates = &address.addresses;
    if candidates.len() == 1 {
        return candidates[0];
    }
    let start = if sticky_hash != 0 {
        (sticky_hash % candidates.len() as u64) as usize
    } else {
        0
    };
    // first pass: skip tried and failed targets
    for i in 0..candidates.len() {
        let c = candidates[(start + i) % candidates.len()];
        if tried.contains(&c) {
            continue;
        }
        let admissible = stock
            .failure_manager
            .get(c)
            .map_or(true, |f| f.check(now, false));
        if admissible {
            return c;
        }
    }
    // second pass: anything not yet tried
    for i in 0..candidates.len() {
        let c = candidates[(start + i) % candidates.len()];
        if !tried.contains(&c) {
            return c;
        }
    }
    candidates[start]
}
