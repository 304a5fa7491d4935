use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, TRANSFER_ENCODING, UPGRADE};

/// Strip hop-by-hop headers before forwarding a message to the other
/// side, per RFC 7230 §6.1. Headers named by `Connection` are removed as
/// well.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    // names listed in Connection are connection-scoped too
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(&name);
    }

    static HOP_HEADERS: &[HeaderName] = &[
        CONNECTION,
        TRANSFER_ENCODING,
        UPGRADE,
        http::header::PROXY_AUTHENTICATE,
        http::header::PROXY_AUTHORIZATION,
        http::header::TE,
        http::header::TRAILER,
    ];
    for h in HOP_HEADERS {
        headers.remove(h);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
}

/// Append the immediate peer to `X-Forwarded-For`.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(peer_ip) {
        headers.insert(XFF.clone(), v);
    }
}

/// An `Upgrade` request/response that must be passed through opaquely.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_standard_and_named_hop_headers() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("close, x-session-tag"));
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(
            HeaderName::from_static("x-session-tag"),
            HeaderValue::from_static("abc"),
        );
        h.insert(
            HeaderName::from_static("keep-alive"),
            HeaderValue::from_static("timeout=5"),
        );
        h.insert(http::header::HOST, HeaderValue::from_static("example.com"));

        strip_hop_headers(&mut h);

        assert!(h.get(CONNECTION).is_none());
        assert!(h.get(TRANSFER_ENCODING).is_none());
        assert!(h.get("x-session-tag").is_none());
        assert!(h.get("keep-alive").is_none());
        assert_eq!(h.get(http::header::HOST).unwrap(), "example.com");
    }

    #[test]
    fn forwarded_for_appends() {
        let mut h = HeaderMap::new();
        append_forwarded_for(&mut h, "10.0.0.1");
        assert_eq!(h.get("x-forwarded-for").unwrap(), "10.0.0.1");
        append_forwarded_for(&mut h, "10.0.0.2");
        assert_eq!(h.get("x-forwarded-for").unwrap(), "10.0.0.1, 10.0.0.2");
    }

    #[test]
    fn upgrade_detection() {
        let mut h = HeaderMap::new();
        h.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade(&h));
        h.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_upgrade(&h));
    }
}
