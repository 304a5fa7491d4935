pub mod rfc;
pub mod rubber;

use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::{tee, BoxIstream};
use crate::resource::{RequestEnv, ResourceAddress, ResourceLoader};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use lru::LruCache;
use rfc::CacheRequestInfo;
use rubber::{Rubber, RubberId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct HttpCacheConfig {
    /// rubber arena size for cached bodies
    pub size: usize,
    /// documents larger than this are never cached
    pub cacheable_size_limit: u64,
    /// honour request Cache-Control: no-cache / Pragma: no-cache
    pub obey_no_cache: bool,
    pub max_entries: usize,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            size: 64 * 1024 * 1024,
            cacheable_size_limit: 512 * 1024,
            obey_no_cache: true,
            max_entries: 65536,
        }
    }
}

struct DocumentInfo {
    expires: Option<SystemTime>,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// One stored response variant.
struct CacheDocument {
    status: StatusCode,
    headers: Mutex<HeaderMap>,
    info: Mutex<DocumentInfo>,
    vary: Vec<(String, String)>,
    body: Option<(RubberId, u64)>,
    tag: Option<String>,
    stored_at: SystemTime,
}

impl CacheDocument {
    fn is_fresh(&self, now: SystemTime) -> bool {
        match self.info.lock().unwrap().expires {
            Some(expires) => expires > now,
            None => false,
        }
    }
}

/// The shared HTTP response cache: an LRU document index over a rubber
/// body arena, plus a per-tag index for targeted flushes.
pub struct HttpCache {
    config: HttpCacheConfig,
    pub rubber: Arc<Rubber>,
    entries: Mutex<LruCache<String, Vec<Arc<CacheDocument>>>>,
    /// cache keys per flush tag
    tags: Mutex<HashMap<String, HashSet<String>>>,
    /// keys currently being populated; secondary requests skip the tee
    in_flight: Mutex<HashSet<String>>,
}

impl HttpCache {
    pub fn new(config: HttpCacheConfig) -> Arc<Self> {
        let rubber = Rubber::new(config.size);
        Arc::new(Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.max_entries.max(1)).unwrap(),
            )),
            tags: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            rubber,
            config,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn lookup(&self, key: &str, request_headers: &HeaderMap) -> Option<Arc<CacheDocument>> {
        let mut entries = self.entries.lock().unwrap();
        let docs = entries.get(key)?;
        docs.iter()
            .find(|doc| rfc::vary_fits(&doc.vary, request_headers))
            .cloned()
    }

    fn insert(&self, key: String, doc: Arc<CacheDocument>) {
        if let Some(tag) = &doc.tag {
            self.tags
                .lock()
                .unwrap()
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        let mut entries = self.entries.lock().unwrap();
        let evicted = match entries.get_mut(&key) {
            Some(docs) => {
                docs.retain(|existing| {
                    let keep = existing.vary != doc.vary;
                    if !keep {
                        if let Some((id, _)) = existing.body {
                            self.rubber.remove(id);
                        }
                    }
                    keep
                });
                docs.push(doc);
                None
            }
            None => entries.push(key, vec![doc]),
        };
        if let Some((_, docs)) = evicted {
            for doc in docs {
                if let Some((id, _)) = doc.body {
                    self.rubber.remove(id);
                }
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some(docs) = self.entries.lock().unwrap().pop(key) {
            for doc in docs {
                if let Some((id, _)) = doc.body {
                    self.rubber.remove(id);
                }
            }
        }
    }

    /// Drop every entry stored under `tag`.
    pub fn flush_tag(&self, tag: &str) {
        let keys = self.tags.lock().unwrap().remove(tag);
        if let Some(keys) = keys {
            debug!("cache: flushing tag '{}' ({} keys)", tag, keys.len());
            for key in keys {
                self.remove(&key);
            }
        }
    }

    pub fn flush_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        while let Some((_, docs)) = entries.pop_lru() {
            for doc in docs {
                if let Some((id, _)) = doc.body {
                    self.rubber.remove(id);
                }
            }
        }
        self.tags.lock().unwrap().clear();
    }

    fn document_response(&self, doc: &CacheDocument, info: &CacheRequestInfo) -> HttpResponse {
        if let Some(status) = conditional_status(doc, info) {
            return HttpResponse::new(status, doc.headers.lock().unwrap().clone(), None);
        }
        let mut headers = doc.headers.lock().unwrap().clone();
        if let Ok(age) = SystemTime::now().duration_since(doc.stored_at) {
            if let Ok(v) = HeaderValue::from_str(&age.as_secs().to_string()) {
                headers.insert(http::header::AGE, v);
            }
        }
        let body = doc
            .body
            .and_then(|(id, _)| self.rubber.get(id))
            .map(crate::istream::from_bytes);
        metrics::counter!("proxy_cache_hits_total").increment(1);
        HttpResponse::new(doc.status, headers, body)
    }
}

/// Evaluate the client's conditional headers against a cached document.
fn conditional_status(doc: &CacheDocument, info: &CacheRequestInfo) -> Option<StatusCode> {
    let doc_info = doc.info.lock().unwrap();
    let etag = doc_info.etag.as_deref();
    let last_modified = doc_info
        .last_modified
        .as_deref()
        .and_then(|v| httpdate::parse_http_date(v).ok());

    if let Some(if_match) = &info.if_match {
        let matches = if_match == "*"
            || etag.map_or(false, |e| {
                if_match.split(',').any(|t| t.trim() == e)
            });
        if !matches {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }

    if let (Some(ius), Some(lm)) = (info.if_unmodified_since, last_modified) {
        if lm > ius {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }

    if let Some(if_none_match) = &info.if_none_match {
        let matches = if_none_match == "*"
            || etag.map_or(false, |e| {
                if_none_match.split(',').any(|t| t.trim() == e)
            });
        if matches {
            return Some(StatusCode::NOT_MODIFIED);
        }
        return None;
    }

    if let (Some(ims), Some(lm)) = (info.if_modified_since, last_modified) {
        if lm <= ims {
            return Some(StatusCode::NOT_MODIFIED);
        }
    }

    None
}

/// `ResourceLoader` decorator implementing RFC 2616 §13 caching in front
/// of the wrapped loader.
pub struct CachingResourceLoader<L> {
    cache: Arc<HttpCache>,
    inner: Arc<L>,
}

impl<L: ResourceLoader + 'static> CachingResourceLoader<L> {
    pub fn new(cache: Arc<HttpCache>, inner: Arc<L>) -> Self {
        Self { cache, inner }
    }

    async fn dispatch(
        &self,
        address: &ResourceAddress,
        env: RequestEnv,
        method: Method,
        headers: HeaderMap,
        body: Option<BoxIstream>,
    ) -> Result<HttpResponse, ProxyError> {
        let cache = &self.cache;
        let key = address.id();

        let info = rfc::request_evaluate(
            &method,
            address,
            &headers,
            cache.config.obey_no_cache,
            body.is_some(),
        );
        let Some(info) = info else {
            if rfc::request_invalidates(&method) {
                cache.remove(&key);
            }
            return self
                .inner
                .send_request(address, env, method, headers, body)
                .await;
        };

        let now = SystemTime::now();

        if let Some(doc) = cache.lookup(&key, &headers) {
            if doc.is_fresh(now) {
                trace!("cache: fresh hit, key={}", key);
                return Ok(cache.document_response(&doc, &info));
            }
            return self.revalidate(address, env, key, doc, info, headers).await;
        }

        if info.only_if_cached {
            metrics::counter!("proxy_cache_only_if_cached_misses_total").increment(1);
            return Ok(HttpResponse::message(
                StatusCode::GATEWAY_TIMEOUT,
                "not cached\n",
            ));
        }

        metrics::counter!("proxy_cache_misses_total").increment(1);
        let cache_tag = env.cache_tag.clone();
        let response = self
            .inner
            .send_request(address, env, method, headers.clone(), None)
            .await?;
        Ok(self.maybe_store(key, cache_tag, &info, &headers, response, now))
    }

    /// Miss path: forward the response, tee-ing a cacheable body into
    /// the rubber arena. The entry becomes visible only when the sink
    /// has the complete body.
    fn maybe_store(
        &self,
        key: String,
        cache_tag: Option<String>,
        info: &CacheRequestInfo,
        request_headers: &HeaderMap,
        response: HttpResponse,
        now: SystemTime,
    ) -> HttpResponse {
        let cache = &self.cache;
        let body_available = response.body.as_ref().and_then(|b| b.available(false));
        let Some(response_info) = rfc::response_evaluate(
            info,
            response.status,
            &response.headers,
            body_available,
            cache.config.cacheable_size_limit,
            now,
        ) else {
            return response;
        };

        {
            let mut in_flight = cache.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                // someone else is already populating this key
                return response;
            }
        }

        let vary = response_info
            .vary
            .as_deref()
            .map(|v| rfc::copy_vary(v, request_headers))
            .unwrap_or_default();

        let HttpResponse {
            status,
            headers,
            body,
        } = response;

        let stored_headers = headers.clone();
        let doc = move |body: Option<(RubberId, u64)>| CacheDocument {
            status,
            headers: Mutex::new(stored_headers),
            info: Mutex::new(DocumentInfo {
                expires: response_info.expires,
                etag: response_info.etag.clone(),
                last_modified: response_info.last_modified.clone(),
            }),
            vary,
            body,
            tag: cache_tag,
            stored_at: now,
        };

        match body {
            None => {
                cache.in_flight.lock().unwrap().remove(&key);
                cache.insert(key, Arc::new(doc(None)));
                HttpResponse::new(status, headers, None)
            }
            Some(body) => {
                let (forward, to_sink) = tee(body);
                let cache = self.cache.clone();
                let limit = cache.config.cacheable_size_limit;
                let make_doc = doc;
                tokio::spawn(async move {
                    let stored =
                        rubber::sink_rubber(&cache.rubber, Box::new(to_sink), limit).await;
                    cache.in_flight.lock().unwrap().remove(&key);
                    match stored {
                        Some((id, len)) => {
                            cache.insert(key, Arc::new(make_doc(Some((id, len)))));
                        }
                        None => {
                            // out of memory / too large / upstream error:
                            // never surface a partial entry
                            trace!("cache: population abandoned, key={}", key);
                        }
                    }
                });
                HttpResponse::new(status, headers, Some(Box::new(forward)))
            }
        }
    }

    /// Expired hit: ask the origin whether the entry is still valid.
    async fn revalidate(
        &self,
        address: &ResourceAddress,
        env: RequestEnv,
        key: String,
        doc: Arc<CacheDocument>,
        info: CacheRequestInfo,
        request_headers: HeaderMap,
    ) -> Result<HttpResponse, ProxyError> {
        let cache = &self.cache;
        metrics::counter!("proxy_cache_revalidations_total").increment(1);

        let mut conditional_headers = request_headers.clone();
        {
            let doc_info = doc.info.lock().unwrap();
            if let Some(etag) = &doc_info.etag {
                if let Ok(v) = HeaderValue::from_str(etag) {
                    conditional_headers.insert(http::header::IF_NONE_MATCH, v);
                }
            }
            if let Some(lm) = &doc_info.last_modified {
                if let Ok(v) = HeaderValue::from_str(lm) {
                    conditional_headers.insert(http::header::IF_MODIFIED_SINCE, v);
                }
            }
        }

        let cache_tag = env.cache_tag.clone();
        let response = self
            .inner
            .send_request(address, env, Method::GET, conditional_headers, None)
            .await?;

        let now = SystemTime::now();

        if response.status == StatusCode::NOT_MODIFIED {
            // refresh expiry information (Expires / Cache-Control only)
            if let Some(new_info) = rfc::response_evaluate(
                &info,
                StatusCode::OK,
                &response.headers,
                None,
                cache.config.cacheable_size_limit,
                now,
            ) {
                doc.info.lock().unwrap().expires = new_info.expires;
            }
            let mut headers = doc.headers.lock().unwrap();
            for name in [http::header::EXPIRES, http::header::CACHE_CONTROL] {
                match response.headers.get(&name) {
                    Some(v) => {
                        headers.insert(name, v.clone());
                    }
                    None => {}
                }
            }
            drop(headers);
            if let Some(body) = response.body {
                drop(body);
            }
            trace!("cache: revalidated, key={}", key);
            return Ok(cache.document_response(&doc, &info));
        }

        if rfc::prefer_cached(
            doc.info.lock().unwrap().etag.as_deref(),
            &response.headers,
        ) {
            // origin resent the same entity; keep our copy and refresh
            if let Some(body) = response.body {
                drop(body);
            }
            if let Some(new_info) = rfc::response_evaluate(
                &info,
                response.status,
                &response.headers,
                None,
                cache.config.cacheable_size_limit,
                now,
            ) {
                doc.info.lock().unwrap().expires = new_info.expires;
            }
            return Ok(cache.document_response(&doc, &info));
        }

        // the entity changed: evict and treat like a miss
        cache.remove(&key);
        Ok(self.maybe_store(key, cache_tag, &info, &request_headers, response, now))
    }
}

impl<L: ResourceLoader + 'static> ResourceLoader for CachingResourceLoader<L> {
    fn send_request<'a>(
        &'a self,
        address: &'a ResourceAddress,
        env: RequestEnv,
        method: Method,
        headers: HeaderMap,
        body: Option<BoxIstream>,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, ProxyError>> + Send + 'a>> {
        Box::pin(self.dispatch(address, env, method, headers, body))
    }
}

/// Wrap a response observer that flushes `tag` once a modifying request
/// succeeded (status below 400).
pub fn auto_flush_on_success(
    cache: &Arc<HttpCache>,
    tag: String,
    response: &HttpResponse,
) {
    if response.status.as_u16() < 400 {
        cache.flush_tag(&tag);
    }
}
