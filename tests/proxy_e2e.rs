//! Proxy-level scenarios against real TCP backends: cache population,
//! revalidation via If-None-Match, and failure-aware connect retries.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_proxy::cache::{CachingResourceLoader, HttpCache, HttpCacheConfig};
use trellis_proxy::cluster::FailureManager;
use trellis_proxy::http1::server::{serve_connection, RequestHandler, ServerTimeouts};
use trellis_proxy::http1::{HttpResponse, IncomingRequest};
use trellis_proxy::resource::child::ChildStock;
use trellis_proxy::resource::file::NfsReadCache;
use trellis_proxy::resource::http::{send_http_request, HttpStock};
use trellis_proxy::resource::{
    DirectResourceLoader, HttpAddress, RequestEnv, ResourceAddress, ResourceLoader,
};
use trellis_proxy::socket::FilteredSocket;

async fn start_backend<H: RequestHandler>(handler: Arc<H>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(serve_connection(
                FilteredSocket::new_tcp(stream),
                peer,
                false,
                handler,
                ServerTimeouts::default(),
            ));
        }
    });
    addr
}

fn direct_loader(failure_manager: Arc<FailureManager>) -> Arc<DirectResourceLoader> {
    Arc::new(DirectResourceLoader {
        http_stock: Arc::new(HttpStock::new(failure_manager, 4)),
        child_stock: Arc::new(ChildStock::new(std::env::temp_dir().join("trellis-test"), 1)),
        nfs_cache: Arc::new(NfsReadCache::new(std::env::temp_dir(), 8)),
    })
}

fn http_address(addr: SocketAddr, path: &str) -> ResourceAddress {
    ResourceAddress::Http(HttpAddress {
        https: false,
        host_and_port: format!("origin:{}", addr.port()),
        path: path.to_string(),
        addresses: vec![addr],
    })
}

struct Origin {
    hits: AtomicUsize,
    revalidations: AtomicUsize,
}

impl RequestHandler for Origin {
    fn handle(
        &self,
        request: IncomingRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HttpResponse> + Send + '_>> {
        Box::pin(async move {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let mut headers = http::HeaderMap::new();
            headers.insert(
                http::header::DATE,
                http::HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now()))
                    .unwrap(),
            );
            headers.insert(http::header::ETAG, http::HeaderValue::from_static("\"v1\""));
            headers.insert(
                http::header::CACHE_CONTROL,
                http::HeaderValue::from_static("max-age=1"),
            );

            if request.header("if-none-match") == Some("\"v1\"") {
                self.revalidations.fetch_add(1, Ordering::SeqCst);
                return HttpResponse::new(http::StatusCode::NOT_MODIFIED, headers, None);
            }

            headers.insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain"),
            );
            HttpResponse::new(
                http::StatusCode::OK,
                headers,
                Some(trellis_proxy::istream::from_bytes("hello")),
            )
        })
    }
}

/// Spec'd revalidation flow: a fresh entry is served from the cache, an
/// expired one is revalidated with If-None-Match, and a 304 refreshes
/// the entry in place while serving the cached body.
#[tokio::test]
async fn cache_revalidation_with_304() {
    let origin = Arc::new(Origin {
        hits: AtomicUsize::new(0),
        revalidations: AtomicUsize::new(0),
    });
    let backend = start_backend(origin.clone()).await;

    let failure_manager = Arc::new(FailureManager::new());
    let cache = HttpCache::new(HttpCacheConfig::default());
    let loader = CachingResourceLoader::new(cache.clone(), direct_loader(failure_manager));
    let address = http_address(backend, "/x");

    async fn fetch(
        loader: &CachingResourceLoader<DirectResourceLoader>,
        address: &ResourceAddress,
    ) -> (http::StatusCode, bytes::Bytes) {
        let response = loader
            .send_request(
                address,
                RequestEnv::default(),
                http::Method::GET,
                http::HeaderMap::new(),
                None,
            )
            .await
            .unwrap();
        let status = response.status;
        let body = match response.body {
            Some(b) => trellis_proxy::istream::collect(b).await.unwrap(),
            None => bytes::Bytes::new(),
        };
        (status, body)
    }

    // miss: forwarded to the origin, tee'd into the cache
    let (status, body) = fetch(&loader, &address).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(&body[..], b"hello");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    // wait until the population task has committed the entry
    let deadline = Instant::now() + Duration::from_secs(2);
    while cache.entry_count() == 0 {
        assert!(Instant::now() < deadline, "cache entry never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // fresh hit: served without touching the origin
    let (status, body) = fetch(&loader, &address).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(&body[..], b"hello");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1, "no origin contact on fresh hit");

    // let the entry expire, then revalidate
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let (status, body) = fetch(&loader, &address).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(&body[..], b"hello", "cached body served after 304");
    assert_eq!(origin.revalidations.load(Ordering::SeqCst), 1);

    // the 304 refreshed the expiry: the next request is a fresh hit
    let hits_before = origin.hits.load(Ordering::SeqCst);
    let (status, _) = fetch(&loader, &address).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(origin.hits.load(Ordering::SeqCst), hits_before);
}

async fn trivial_backend() -> SocketAddr {
    start_backend(Arc::new(|_request: IncomingRequest| async {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain"),
        );
        HttpResponse::new(
            http::StatusCode::OK,
            headers,
            Some(trellis_proxy::istream::from_bytes("alive")),
        )
    }))
    .await
}

/// One member of the address list refuses connections: the request is
/// retried against the next member, and the failed member is marked in
/// the failure manager.
#[tokio::test]
async fn connect_retry_marks_failed_member() {
    // reserve a port, then close the listener so connects are refused
    let dead_addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let live_addr = trivial_backend().await;

    let failure_manager = Arc::new(FailureManager::new());
    let stock = HttpStock::new(failure_manager.clone(), 4);

    let address = HttpAddress {
        https: false,
        host_and_port: "cluster.internal".into(),
        path: "/".into(),
        addresses: vec![dead_addr, live_addr],
    };

    // sticky hash 0 starts at the first (dead) member
    let response = send_http_request(
        &stock,
        &address,
        0,
        http::Method::GET,
        http::HeaderMap::new(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(response.status, http::StatusCode::OK);
    let body = trellis_proxy::istream::collect(response.body.unwrap())
        .await
        .unwrap();
    assert_eq!(&body[..], b"alive");

    // the dead member is now marked failed
    let info = failure_manager
        .get(dead_addr)
        .expect("failure state recorded");
    assert!(!info.check(Instant::now(), true));

    // a second request goes straight to the live member
    let response = send_http_request(
        &stock,
        &address,
        0,
        http::Method::GET,
        http::HeaderMap::new(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(response.status, http::StatusCode::OK);
}
