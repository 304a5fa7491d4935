use crate::resource::ResourceAddress;
use http::{HeaderMap, Method, StatusCode};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Extracted request features relevant to the cache.
#[derive(Debug, Default)]
pub struct CacheRequestInfo {
    /// origin is a remote HTTP server, so its clock may drift from ours
    pub is_remote: bool,
    pub only_if_cached: bool,
    pub has_query_string: bool,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Check whether the request could produce a cacheable response.
/// RFC 2616 13.11: only GET without a body is read-through cacheable.
pub fn request_evaluate(
    method: &Method,
    address: &ResourceAddress,
    headers: &HeaderMap,
    obey_no_cache: bool,
    has_request_body: bool,
) -> Option<CacheRequestInfo> {
    if method != Method::GET || has_request_body {
        return None;
    }

    if headers.contains_key(http::header::RANGE) {
        return None;
    }

    // RFC 2616 14.8: responses to requests with Authorization must not
    // be served to anybody else
    if headers.contains_key(http::header::AUTHORIZATION) {
        return None;
    }

    let mut only_if_cached = false;
    if let Some(cache_control) = header(headers, "cache-control") {
        for s in cache_control.split(',') {
            let s = s.trim();
            if obey_no_cache && (s == "no-cache" || s == "no-store") {
                return None;
            }
            if s == "only-if-cached" {
                only_if_cached = true;
            }
        }
    } else if obey_no_cache {
        if let Some(pragma) = header(headers, "pragma") {
            if pragma == "no-cache" {
                return None;
            }
        }
    }

    Some(CacheRequestInfo {
        is_remote: matches!(address, ResourceAddress::Http(_)),
        only_if_cached,
        has_query_string: address.has_query_string(),
        if_match: header(headers, "if-match").map(str::to_string),
        if_none_match: header(headers, "if-none-match").map(str::to_string),
        if_modified_since: header(headers, "if-modified-since")
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        if_unmodified_since: header(headers, "if-unmodified-since")
            .and_then(|v| httpdate::parse_http_date(v).ok()),
    })
}

/// RFC 2616 13.10: modifying methods invalidate the entity.
pub fn request_invalidates(method: &Method) -> bool {
    method == Method::PUT || method == Method::DELETE || method == Method::POST
}

/// RFC 2616 13.4: statuses a shared cache may store.
fn status_cacheable(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 206 | 300 | 301 | 410
    )
}

/// What the cache remembers about a stored response.
#[derive(Debug, Clone, Default)]
pub struct CacheResponseInfo {
    pub expires: Option<SystemTime>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// comma-joined Vary header names, if any
    pub vary: Option<String>,
}

/// Clock offset between us and the origin, derived from its `Date`
/// header. `None` means the origin did not tell us its time, which for
/// remote origins makes expiry computation unsafe.
fn server_date_offset(
    request_info: &CacheRequestInfo,
    now: SystemTime,
    headers: &HeaderMap,
) -> Option<(bool, Duration)> {
    if !request_info.is_remote {
        // local backend (FastCGI, WAS, file): same clock
        return Some((false, Duration::ZERO));
    }
    let server_date = header(headers, "date").and_then(|v| httpdate::parse_http_date(v).ok())?;
    match now.duration_since(server_date) {
        Ok(d) => Some((false, d)),
        Err(e) => Some((true, e.duration())),
    }
}

fn apply_offset(t: SystemTime, negative: bool, offset: Duration) -> SystemTime {
    if negative {
        t - offset
    } else {
        t + offset
    }
}

/// Decide whether (and until when) a response may be stored.
pub fn response_evaluate(
    request_info: &CacheRequestInfo,
    status: StatusCode,
    headers: &HeaderMap,
    body_available: Option<u64>,
    cacheable_size_limit: u64,
    now: SystemTime,
) -> Option<CacheResponseInfo> {
    if !status_cacheable(status) {
        return None;
    }

    if let Some(n) = body_available {
        if n > cacheable_size_limit {
            return None;
        }
    }

    let mut info = CacheResponseInfo::default();

    if let Some(cache_control) = header(headers, "cache-control") {
        for s in cache_control.split(',') {
            let s = s.trim();
            if s.starts_with("private") || s == "no-cache" || s == "no-store" {
                return None;
            }
            if let Some(value) = s.strip_prefix("max-age=") {
                // RFC 2616 14.9.3
                if let Ok(seconds) = value.parse::<u64>() {
                    if seconds > 0 {
                        info.expires = Some(now + Duration::from_secs(seconds));
                    }
                }
            }
        }
    }

    let (neg, offset) = server_date_offset(request_info, now, headers)?;

    if info.expires.is_none() {
        // RFC 2616 14.9.3: max-age would have overridden Expires
        if let Some(expires) =
            header(headers, "expires").and_then(|v| httpdate::parse_http_date(v).ok())
        {
            let adjusted = apply_offset(expires, neg, offset);
            if adjusted < now {
                debug!("cache: 'expires' header lies in the past");
            }
            info.expires = Some(adjusted);
        }
    }

    // RFC 2616 13.9: query strings are only cacheable with an explicit
    // expiry
    if request_info.has_query_string && info.expires.is_none() {
        return None;
    }

    info.last_modified = header(headers, "last-modified").map(str::to_string);
    info.etag = header(headers, "etag").map(str::to_string);

    let mut vary: Option<String> = None;
    for value in headers.get_all(http::header::VARY) {
        let Ok(value) = value.to_str() else { continue };
        if value.is_empty() {
            continue;
        }
        if value.trim() == "*" {
            // RFC 2616 13.6: Vary "*" never matches
            return None;
        }
        vary = Some(match vary {
            None => value.to_string(),
            Some(prev) => format!("{}, {}", prev, value),
        });
    }
    info.vary = vary;

    if info.expires.is_none() && info.last_modified.is_none() && info.etag.is_none() {
        return None;
    }

    Some(info)
}

/// Capture the request-header values named by `vary` as part of the
/// cache key.
pub fn copy_vary(vary: &str, request_headers: &HeaderMap) -> Vec<(String, String)> {
    vary.split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .map(|name| {
            let value = header(request_headers, &name).unwrap_or("").to_string();
            (name, value)
        })
        .collect()
}

/// Does a stored variant match this request's headers?
pub fn vary_fits(vary: &[(String, String)], request_headers: &HeaderMap) -> bool {
    vary.iter()
        .all(|(name, value)| header(request_headers, name).unwrap_or("") == value)
}

/// "Stronger ETag match": the origin replied with the same entity tag the
/// cache already holds, so the cached body is just as good.
pub fn prefer_cached(cached_etag: Option<&str>, response_headers: &HeaderMap) -> bool {
    let Some(cached) = cached_etag else {
        return false;
    };
    header(response_headers, "etag") == Some(cached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{FileAddress, HttpAddress};
    use http::HeaderValue;

    fn http_address(path: &str) -> ResourceAddress {
        ResourceAddress::Http(HttpAddress {
            path: path.into(),
            ..Default::default()
        })
    }

    fn get_info(headers: &HeaderMap) -> Option<CacheRequestInfo> {
        request_evaluate(&Method::GET, &http_address("/x"), headers, true, false)
    }

    #[test]
    fn only_bodyless_get_is_cacheable() {
        let h = HeaderMap::new();
        assert!(get_info(&h).is_some());
        assert!(request_evaluate(&Method::POST, &http_address("/x"), &h, true, false).is_none());
        assert!(request_evaluate(&Method::GET, &http_address("/x"), &h, true, true).is_none());
    }

    #[test]
    fn range_and_authorization_bypass() {
        let mut h = HeaderMap::new();
        h.insert(http::header::RANGE, HeaderValue::from_static("bytes=0-1"));
        assert!(get_info(&h).is_none());

        let mut h = HeaderMap::new();
        h.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer x"),
        );
        assert!(get_info(&h).is_none());
    }

    #[test]
    fn no_cache_and_only_if_cached() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
        assert!(get_info(&h).is_none());

        let mut h = HeaderMap::new();
        h.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("only-if-cached"),
        );
        assert!(get_info(&h).unwrap().only_if_cached);

        let mut h = HeaderMap::new();
        h.insert(http::header::PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(get_info(&h).is_none());
    }

    fn local_request_info() -> CacheRequestInfo {
        request_evaluate(
            &Method::GET,
            &ResourceAddress::Local(FileAddress::default()),
            &HeaderMap::new(),
            true,
            false,
        )
        .unwrap()
    }

    #[test]
    fn max_age_sets_expiry() {
        let mut h = HeaderMap::new();
        h.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=60"),
        );
        let now = SystemTime::now();
        let info = response_evaluate(
            &local_request_info(),
            StatusCode::OK,
            &h,
            Some(10),
            1024,
            now,
        )
        .unwrap();
        assert_eq!(info.expires, Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn private_and_no_store_are_uncacheable() {
        for value in ["private", "no-store", "no-cache"] {
            let mut h = HeaderMap::new();
            h.insert(
                http::header::CACHE_CONTROL,
                HeaderValue::from_str(value).unwrap(),
            );
            h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
            assert!(response_evaluate(
                &local_request_info(),
                StatusCode::OK,
                &h,
                None,
                1024,
                SystemTime::now(),
            )
            .is_none());
        }
    }

    #[test]
    fn uncacheable_statuses() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
        for status in [StatusCode::FORBIDDEN, StatusCode::INTERNAL_SERVER_ERROR] {
            assert!(response_evaluate(
                &local_request_info(),
                status,
                &h,
                None,
                1024,
                SystemTime::now(),
            )
            .is_none());
        }
        assert!(response_evaluate(
            &local_request_info(),
            StatusCode::GONE,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_some());
    }

    #[test]
    fn size_limit_rejects_large_bodies() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
        assert!(response_evaluate(
            &local_request_info(),
            StatusCode::OK,
            &h,
            Some(2048),
            1024,
            SystemTime::now(),
        )
        .is_none());
    }

    #[test]
    fn remote_origin_requires_date() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
        let remote = get_info(&HeaderMap::new()).unwrap();
        assert!(remote.is_remote);
        // no Date header: cannot judge expiry of a remote response
        assert!(response_evaluate(
            &remote,
            StatusCode::OK,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_none());

        h.insert(
            http::header::DATE,
            HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())).unwrap(),
        );
        assert!(response_evaluate(
            &remote,
            StatusCode::OK,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_some());
    }

    #[test]
    fn vary_star_is_uncacheable() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
        h.insert(http::header::VARY, HeaderValue::from_static("*"));
        assert!(response_evaluate(
            &local_request_info(),
            StatusCode::OK,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_none());
    }

    #[test]
    fn vary_capture_and_match() {
        let mut req = HeaderMap::new();
        req.insert(
            http::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("de"),
        );
        let vary = copy_vary("Accept-Language, X-Missing", &req);
        assert_eq!(
            vary,
            vec![
                ("accept-language".to_string(), "de".to_string()),
                ("x-missing".to_string(), "".to_string()),
            ]
        );
        assert!(vary_fits(&vary, &req));

        let mut other = HeaderMap::new();
        other.insert(
            http::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr"),
        );
        assert!(!vary_fits(&vary, &other));
    }

    #[test]
    fn query_string_needs_explicit_expiry() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v\""));
        let mut info = local_request_info();
        info.has_query_string = true;
        assert!(response_evaluate(
            &info,
            StatusCode::OK,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_none());

        h.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=5"),
        );
        assert!(response_evaluate(
            &info,
            StatusCode::OK,
            &h,
            None,
            1024,
            SystemTime::now(),
        )
        .is_some());
    }

    #[test]
    fn stronger_etag_match() {
        let mut h = HeaderMap::new();
        h.insert(http::header::ETAG, HeaderValue::from_static("\"v1\""));
        assert!(prefer_cached(Some("\"v1\""), &h));
        assert!(!prefer_cached(Some("\"v2\""), &h));
        assert!(!prefer_cached(None, &h));
    }

    #[test]
    fn invalidating_methods() {
        assert!(request_invalidates(&Method::POST));
        assert!(request_invalidates(&Method::PUT));
        assert!(request_invalidates(&Method::DELETE));
        assert!(!request_invalidates(&Method::GET));
    }
}
