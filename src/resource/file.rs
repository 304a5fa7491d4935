use super::address::{FileAddress, NfsAddress};
use crate::error::ProxyError;
use crate::http1::HttpResponse;
use crate::istream::FileIstream;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Serve a static file. The caller must have disposed of any request
/// body; this backend cannot carry one.
pub fn serve_file(address: &FileAddress, method: &Method, headers: &HeaderMap) -> HttpResponse {
    if method != Method::GET && method != Method::HEAD {
        return HttpResponse::message(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }

    let path = Path::new(&address.path);
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => return open_error_response(&address.path, e),
    };
    let metadata = match file.metadata() {
        Ok(m) => m,
        Err(e) => return open_error_response(&address.path, e),
    };
    if metadata.is_dir() {
        return HttpResponse::message(StatusCode::NOT_FOUND, "not found\n");
    }

    let etag = file_etag(&metadata);
    let mtime = metadata.modified().ok();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        http::header::CONTENT_TYPE,
        content_type_for(address.content_type.as_deref(), path),
    );
    if let Ok(v) = HeaderValue::from_str(&etag) {
        response_headers.insert(http::header::ETAG, v);
    }
    if let Some(mtime) = mtime {
        if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(mtime)) {
            response_headers.insert(http::header::LAST_MODIFIED, v);
        }
    }

    if let Some(status) = check_conditionals(headers, &etag, mtime) {
        return HttpResponse::new(status, response_headers, None);
    }

    let body = FileIstream::new(file, 0, metadata.len());
    HttpResponse::new(StatusCode::OK, response_headers, Some(Box::new(body)))
}

fn open_error_response(path: &str, e: std::io::Error) -> HttpResponse {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            HttpResponse::message(StatusCode::NOT_FOUND, "not found\n")
        }
        std::io::ErrorKind::PermissionDenied => {
            HttpResponse::message(StatusCode::FORBIDDEN, "forbidden\n")
        }
        _ => {
            debug!("file: open failed, path={}, error={}", path, e);
            HttpResponse::message(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

/// Evaluate If-None-Match / If-Modified-Since against the file.
fn check_conditionals(
    headers: &HeaderMap,
    etag: &str,
    mtime: Option<SystemTime>,
) -> Option<StatusCode> {
    if let Some(inm) = headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if inm == "*" || inm.split(',').any(|t| t.trim() == etag) {
            return Some(StatusCode::NOT_MODIFIED);
        }
        return None;
    }
    if let (Some(ims), Some(mtime)) = (
        headers
            .get(http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        mtime,
    ) {
        if mtime <= ims {
            return Some(StatusCode::NOT_MODIFIED);
        }
    }
    None
}

fn file_etag(metadata: &std::fs::Metadata) -> String {
    format!(
        "\"{:x}-{:x}-{:x}\"",
        metadata.dev(),
        metadata.ino(),
        metadata.mtime()
    )
}

fn content_type_for(configured: Option<&str>, path: &Path) -> HeaderValue {
    if let Some(ct) = configured {
        if let Ok(v) = HeaderValue::from_str(ct) {
            return v;
        }
    }
    let guessed = match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "text/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    };
    HeaderValue::from_static(guessed)
}

struct CachedNfsFile {
    data: Bytes,
    etag: String,
    mtime: Option<SystemTime>,
    content_type: HeaderValue,
    stored: Instant,
}

/// Read-through cache in front of NFS-mounted trees. Whole small files
/// are kept in memory because every miss costs a network round trip;
/// oversized files bypass the cache and stream from the mount.
pub struct NfsReadCache {
    mount_base: PathBuf,
    entries: Mutex<LruCache<String, std::sync::Arc<CachedNfsFile>>>,
    max_file_size: u64,
    ttl: Duration,
}

impl NfsReadCache {
    pub fn new(mount_base: PathBuf, capacity: usize) -> Self {
        Self {
            mount_base,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            max_file_size: 512 * 1024,
            ttl: Duration::from_secs(60),
        }
    }

    fn local_path(&self, address: &NfsAddress) -> PathBuf {
        let mut p = self.mount_base.clone();
        p.push(address.server.trim_matches('/'));
        p.push(address.export.trim_matches('/'));
        p.push(address.path.trim_start_matches('/'));
        p
    }

    pub fn serve(
        &self,
        address: &NfsAddress,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<HttpResponse, ProxyError> {
        if method != Method::GET && method != Method::HEAD {
            return Ok(HttpResponse::message(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed\n",
            ));
        }

        let key = format!("{}:{}:{}", address.server, address.export, address.path);
        if let Some(entry) = self.lookup(&key) {
            return Ok(self.entry_response(&entry, headers));
        }

        let path = self.local_path(address);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => return Ok(open_error_response(&address.path, e)),
        };
        let metadata = file.metadata()?;
        let etag = file_etag(&metadata);
        let mtime = metadata.modified().ok();
        let content_type = content_type_for(address.content_type.as_deref(), &path);

        if metadata.len() <= self.max_file_size {
            let data = std::fs::read(&path).map(Bytes::from)?;
            let entry = std::sync::Arc::new(CachedNfsFile {
                data,
                etag,
                mtime,
                content_type,
                stored: Instant::now(),
            });
            self.entries.lock().unwrap().put(key, entry.clone());
            metrics::counter!("proxy_nfs_cache_misses_total").increment(1);
            return Ok(self.entry_response(&entry, headers));
        }

        // too large to pin in memory; stream it
        let mut response_headers = HeaderMap::new();
        response_headers.insert(http::header::CONTENT_TYPE, content_type);
        if let Ok(v) = HeaderValue::from_str(&etag) {
            response_headers.insert(http::header::ETAG, v);
        }
        if let Some(status) = check_conditionals(headers, &etag, mtime) {
            return Ok(HttpResponse::new(status, response_headers, None));
        }
        let body = FileIstream::new(file, 0, metadata.len());
        Ok(HttpResponse::new(
            StatusCode::OK,
            response_headers,
            Some(Box::new(body)),
        ))
    }

    fn lookup(&self, key: &str) -> Option<std::sync::Arc<CachedNfsFile>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(e) if e.stored.elapsed() <= self.ttl => {
                metrics::counter!("proxy_nfs_cache_hits_total").increment(1);
                Some(e.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn entry_response(&self, entry: &CachedNfsFile, headers: &HeaderMap) -> HttpResponse {
        let mut response_headers = HeaderMap::new();
        response_headers.insert(http::header::CONTENT_TYPE, entry.content_type.clone());
        if let Ok(v) = HeaderValue::from_str(&entry.etag) {
            response_headers.insert(http::header::ETAG, v);
        }
        if let Some(mtime) = entry.mtime {
            if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(mtime)) {
                response_headers.insert(http::header::LAST_MODIFIED, v);
            }
        }
        if let Some(status) = check_conditionals(headers, &entry.etag, entry.mtime) {
            return HttpResponse::new(status, response_headers, None);
        }
        HttpResponse::new(
            StatusCode::OK,
            response_headers,
            Some(crate::istream::from_bytes(entry.data.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_404() {
        let address = FileAddress {
            path: "/does/not/exist".into(),
            ..Default::default()
        };
        let r = serve_file(&address, &Method::GET, &HeaderMap::new());
        assert_eq!(r.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn serves_file_with_validators() {
        let dir = std::env::temp_dir().join(format!("trellis-file-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("index.html");
        std::fs::write(&path, b"<html></html>").unwrap();

        let address = FileAddress {
            path: path.to_str().unwrap().into(),
            ..Default::default()
        };
        let r = serve_file(&address, &Method::GET, &HeaderMap::new());
        assert_eq!(r.status, StatusCode::OK);
        assert_eq!(r.headers.get(http::header::CONTENT_TYPE).unwrap(), "text/html");
        let etag = r.headers.get(http::header::ETAG).unwrap().clone();

        // a matching If-None-Match yields 304
        let mut h = HeaderMap::new();
        h.insert(http::header::IF_NONE_MATCH, etag);
        let r = serve_file(&address, &Method::GET, &h);
        assert_eq!(r.status, StatusCode::NOT_MODIFIED);
        assert!(r.body.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
