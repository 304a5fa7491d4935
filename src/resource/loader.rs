use super::address::ResourceAddress;
use super::child::ChildStock;
use super::file::NfsReadCache;
use super::http::HttpStock;
use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::BoxIstream;
use http::{HeaderMap, Method};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Everything the dispatcher needs to know about one request besides the
/// address.
#[derive(Default, Clone)]
pub struct RequestEnv {
    pub sticky_hash: u64,
    /// tag under which a cacheable response is filed, enabling targeted
    /// flushes
    pub cache_tag: Option<String>,
}

/// Routes a request to exactly one backend. Implementations may wrap
/// each other (caching, filtering); the innermost one talks to the real
/// backends.
pub trait ResourceLoader: Send + Sync {
    fn send_request<'a>(
        &'a self,
        address: &'a ResourceAddress,
        env: RequestEnv,
        method: Method,
        headers: HeaderMap,
        body: Option<BoxIstream>,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, ProxyError>> + Send + 'a>>;
}

/// The terminal loader: a thin multiplexer over the backend transports.
/// No policy lives here, only plumbing.
pub struct DirectResourceLoader {
    pub http_stock: Arc<HttpStock>,
    pub child_stock: Arc<ChildStock>,
    pub nfs_cache: Arc<NfsReadCache>,
}

impl ResourceLoader for DirectResourceLoader {
    fn send_request<'a>(
        &'a self,
        address: &'a ResourceAddress,
        env: RequestEnv,
        method: Method,
        headers: HeaderMap,
        body: Option<BoxIstream>,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            match address {
                ResourceAddress::None => Err(ProxyError::Internal(
                    "request dispatched without an address".into(),
                )),
                ResourceAddress::Local(file) => {
                    // this backend cannot carry a request body
                    drop(body);
                    Ok(super::file::serve_file(file, &method, &headers))
                }
                ResourceAddress::Nfs(nfs) => {
                    drop(body);
                    self.nfs_cache.serve(nfs, &method, &headers)
                }
                ResourceAddress::Pipe(cgi) => super::cgi::run_pipe(cgi, body).await,
                ResourceAddress::Cgi(cgi) => {
                    super::cgi::run_cgi(cgi, &method, &headers, body).await
                }
                ResourceAddress::FastCgi(cgi) => {
                    let remote = if cgi.address_list.is_empty() {
                        None
                    } else {
                        let i = (env.sticky_hash % cgi.address_list.len() as u64) as usize;
                        Some(cgi.address_list[i])
                    };
                    super::fcgi::send_fcgi_request(cgi, remote, method, headers, body).await
                }
                ResourceAddress::Was(cgi) => {
                    super::was::send_was_request(&self.child_stock, cgi, method, headers, body)
                        .await
                }
                ResourceAddress::Lhttp(lhttp) => {
                    super::lhttp::send_lhttp_request(
                        &self.child_stock,
                        lhttp,
                        method,
                        headers,
                        body,
                    )
                    .await
                }
                ResourceAddress::Http(http) => {
                    super::http::send_http_request(
                        &self.http_stock,
                        http,
                        env.sticky_hash,
                        method,
                        headers,
                        body,
                    )
                    .await
                }
            }
        })
    }
}
