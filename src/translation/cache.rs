use super::{TranslateRequest, TranslateResponse, TranslationCommand, TranslationStock};
use crate::error::ProxyError;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, trace};

/// Request features that may participate in a cache key.
const KEYABLE: &[TranslationCommand] = &[
    TranslationCommand::Uri,
    TranslationCommand::Host,
    TranslationCommand::Session,
    TranslationCommand::Realm,
    TranslationCommand::Check,
    TranslationCommand::Auth,
    TranslationCommand::WantFullUri,
    TranslationCommand::WidgetType,
    TranslationCommand::Param,
];

struct CachedTranslation {
    response: TranslateResponse,
    /// feature values captured at store time, for vary matching and
    /// invalidation
    features: HashMap<TranslationCommand, Option<String>>,
    /// request URI at store time; BASE entries substitute its suffix
    uri: String,
    regex: Option<regex::Regex>,
    inverse_regex: Option<regex::Regex>,
    expires: Option<Instant>,
}

impl CachedTranslation {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.map_or(false, |e| e <= now)
    }

    /// Do the request's features match this entry under its vary set?
    fn vary_matches(&self, request: &TranslateRequest) -> bool {
        self.response
            .vary
            .iter()
            .filter(|cmd| **cmd != TranslationCommand::Uri)
            .all(|cmd| self.features.get(cmd).cloned().flatten() == request.feature(*cmd))
    }
}

/// Memoises translation responses. Plain entries are keyed by the full
/// request; BASE entries additionally answer any request whose URI lies
/// below their base prefix, with the suffix substituted back into the
/// response's address.
pub struct TranslationCache {
    stock: TranslationStock,
    entries: Mutex<LruCache<String, Vec<Arc<CachedTranslation>>>>,
    /// base prefix → entries, longest prefix wins
    base_entries: Mutex<Vec<(String, Arc<CachedTranslation>)>>,
}

fn primary_key(request: &TranslateRequest) -> String {
    format!(
        "{}|{}|{}",
        request.host.as_deref().unwrap_or(""),
        request.widget_type.as_deref().unwrap_or(""),
        request.uri
    )
}

impl TranslationCache {
    pub fn new(stock: TranslationStock, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            stock,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            base_entries: Mutex::new(Vec::new()),
        })
    }

    pub async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<Arc<TranslateResponse>, ProxyError> {
        let now = Instant::now();

        if let Some(hit) = self.lookup(request, now) {
            metrics::counter!("proxy_tcache_hits_total").increment(1);
            return Ok(hit);
        }

        metrics::counter!("proxy_tcache_misses_total").increment(1);
        let response = self.stock.translate(request).await?;

        if !response.invalidate.is_empty() {
            self.invalidate(request, &response.invalidate);
        }

        Ok(self.store(request, response, now))
    }

    fn lookup(&self, request: &TranslateRequest, now: Instant) -> Option<Arc<TranslateResponse>> {
        // exact key first
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(list) = entries.get(&primary_key(request)) {
                if let Some(entry) = list
                    .iter()
                    .find(|e| !e.is_expired(now) && e.vary_matches(request))
                {
                    trace!("tcache: exact hit, uri={}", request.uri);
                    return Some(Arc::new(entry.response.clone()));
                }
            }
        }

        // then the longest matching BASE prefix
        let base_entries = self.base_entries.lock().unwrap();
        let mut best: Option<(&String, &Arc<CachedTranslation>)> = None;
        for (base, entry) in base_entries.iter() {
            if !request.uri.starts_with(base.as_str()) {
                continue;
            }
            if entry.is_expired(now) || !entry.vary_matches(request) {
                continue;
            }
            if best.map_or(true, |(b, _)| base.len() > b.len()) {
                best = Some((base, entry));
            }
        }
        let (base, entry) = best?;
        let suffix = &request.uri[base.len()..];

        // ".." escapes are never resubstituted into paths
        if !entry.response.unsafe_base && suffix.split('/').any(|seg| seg == "..") {
            return None;
        }
        if let Some(re) = &entry.regex {
            if !re.is_match(suffix) {
                return None;
            }
        }
        if let Some(re) = &entry.inverse_regex {
            if re.is_match(suffix) {
                return None;
            }
        }
        if !entry.response.easy_base && entry.regex.is_none() {
            return None;
        }

        let old_suffix = entry.uri.strip_prefix(base.as_str())?;
        let mut response = entry.response.clone();

        if let (Some(re), Some(expand)) = (&entry.regex, &entry.response.expand_path) {
            // regex capture expansion of the file path
            let captures = re.captures(suffix)?;
            let expanded = expand_captures(expand, &captures);
            if let crate::resource::ResourceAddress::Local(f) = &mut response.address {
                f.path = expanded;
            }
        } else {
            response.address = entry.response.address.replace_tail(old_suffix, suffix)?;
        }
        if let Some(redirect) = &response.redirect {
            if let Some(stem) = redirect.strip_suffix(old_suffix) {
                response.redirect = Some(format!("{}{}", stem, suffix));
            }
        }
        if let Some(test_path) = &response.test_path {
            if let Some(stem) = test_path.strip_suffix(old_suffix) {
                response.test_path = Some(format!("{}{}", stem, suffix));
            }
        }

        trace!(
            "tcache: base hit, base={}, uri={}",
            base,
            request.uri
        );
        Some(Arc::new(response))
    }

    pub(crate) fn store(
        &self,
        request: &TranslateRequest,
        response: TranslateResponse,
        now: Instant,
    ) -> Arc<TranslateResponse> {
        let result = Arc::new(response.clone());

        let regex = response
            .regex
            .as_deref()
            .and_then(|r| regex::Regex::new(r).ok());
        let inverse_regex = response
            .inverse_regex
            .as_deref()
            .and_then(|r| regex::Regex::new(r).ok());
        let features = KEYABLE
            .iter()
            .map(|cmd| (*cmd, request.feature(*cmd)))
            .collect();
        let entry = Arc::new(CachedTranslation {
            expires: response.max_age.map(|d| now + d),
            features,
            uri: request.uri.clone(),
            regex,
            inverse_regex,
            response,
        });

        if let Some(base) = entry.response.base.clone() {
            if request.uri.starts_with(base.as_str()) {
                let mut base_entries = self.base_entries.lock().unwrap();
                base_entries.retain(|(b, _)| *b != base);
                base_entries.push((base, entry));
                return result;
            }
            debug!(
                "tcache: BASE '{}' does not match uri '{}', not caching",
                base, request.uri
            );
            return result;
        }

        let key = primary_key(request);
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&key) {
            Some(list) => {
                list.retain(|e| !e.vary_matches(request));
                list.push(entry);
            }
            None => {
                entries.push(key, vec![entry]);
            }
        }
        result
    }

    /// Drop all cached entries whose stored features equal the given
    /// request's on every listed component.
    pub fn invalidate(&self, request: &TranslateRequest, components: &[TranslationCommand]) {
        let matches = |entry: &CachedTranslation| -> bool {
            components.iter().all(|cmd| {
                entry.features.get(cmd).cloned().flatten() == request.feature(*cmd)
            })
        };

        let mut dropped = 0usize;
        {
            let mut entries = self.entries.lock().unwrap();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, list)| list.iter().any(|e| matches(e)))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(list) = entries.get_mut(&key) {
                    let before = list.len();
                    list.retain(|e| !matches(e));
                    dropped += before - list.len();
                    if list.is_empty() {
                        entries.pop(&key);
                    }
                }
            }
        }
        {
            let mut base_entries = self.base_entries.lock().unwrap();
            let before = base_entries.len();
            base_entries.retain(|(_, e)| !matches(e));
            dropped += before - base_entries.len();
        }
        debug!("tcache: invalidated {} entries", dropped);
        metrics::counter!("proxy_tcache_invalidations_total").increment(dropped as u64);
    }

    /// Control-channel hook: invalidate with explicit feature values.
    pub fn invalidate_features(
        &self,
        features: HashMap<TranslationCommand, String>,
    ) {
        let mut request = TranslateRequest::default();
        for (cmd, value) in &features {
            match cmd {
                TranslationCommand::Uri => request.uri = value.clone(),
                TranslationCommand::Host => request.host = Some(value.clone()),
                TranslationCommand::Session => request.session = Some(value.clone()),
                TranslationCommand::Realm => request.realm = Some(value.clone()),
                TranslationCommand::WidgetType => request.widget_type = Some(value.clone()),
                TranslationCommand::Param => request.param = Some(value.clone()),
                _ => {}
            }
        }
        let components: Vec<TranslationCommand> = features.keys().copied().collect();
        self.invalidate(&request, &components);
    }
}

fn expand_captures(pattern: &str, captures: &regex::Captures<'_>) -> String {
    // "\1" style references
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                chars.next();
                if let Some(m) = captures.get(d as usize) {
                    out.push_str(m.as_str());
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{FileAddress, ResourceAddress};

    fn cache() -> TranslationCache {
        TranslationCache {
            stock: TranslationStock::new("/nonexistent".into(), 1),
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(64).unwrap())),
            base_entries: Mutex::new(Vec::new()),
        }
    }

    fn local(path: &str) -> TranslateResponse {
        TranslateResponse {
            address: ResourceAddress::Local(FileAddress {
                path: path.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn request(uri: &str) -> TranslateRequest {
        TranslateRequest {
            uri: uri.into(),
            host: Some("example.com".into()),
            ..Default::default()
        }
    }

    #[test]
    fn exact_store_and_lookup() {
        let c = cache();
        let req = request("/page");
        c.store(&req, local("/srv/page"), Instant::now());
        let hit = c.lookup(&req, Instant::now()).unwrap();
        assert!(matches!(
            &hit.address,
            ResourceAddress::Local(f) if f.path == "/srv/page"
        ));
    }

    #[test]
    fn vary_on_session_distinguishes() {
        let c = cache();
        let mut req_a = request("/page");
        req_a.session = Some("s1".into());
        let mut response = local("/srv/a");
        response.vary.push(TranslationCommand::Session);
        c.store(&req_a, response, Instant::now());

        let mut req_b = request("/page");
        req_b.session = Some("s2".into());
        assert!(c.lookup(&req_b, Instant::now()).is_none());
        assert!(c.lookup(&req_a, Instant::now()).is_some());
    }

    #[test]
    fn easy_base_substitutes_suffix() {
        let c = cache();
        let req = request("/app/one.html");
        let mut response = local("/srv/app/one.html");
        response.base = Some("/app/".into());
        response.easy_base = true;
        c.store(&req, response, Instant::now());

        let hit = c.lookup(&request("/app/two.html"), Instant::now()).unwrap();
        assert!(matches!(
            &hit.address,
            ResourceAddress::Local(f) if f.path == "/srv/app/two.html"
        ));
    }

    #[test]
    fn base_rejects_dotdot_unless_unsafe() {
        let c = cache();
        let req = request("/app/one.html");
        let mut response = local("/srv/app/one.html");
        response.base = Some("/app/".into());
        response.easy_base = true;
        c.store(&req, response, Instant::now());

        assert!(c
            .lookup(&request("/app/../etc/passwd"), Instant::now())
            .is_none());

        let req2 = request("/unsafe/one.html");
        let mut response = local("/srv/unsafe/one.html");
        response.base = Some("/unsafe/".into());
        response.easy_base = true;
        response.unsafe_base = true;
        c.store(&req2, response, Instant::now());
        assert!(c
            .lookup(&request("/unsafe/../one.html"), Instant::now())
            .is_some());
    }

    #[test]
    fn regex_gates_base_reuse() {
        let c = cache();
        let req = request("/img/a.png");
        let mut response = local("/srv/img/a.png");
        response.base = Some("/img/".into());
        response.regex = Some(r"^[a-z]+\.png$".into());
        c.store(&req, response, Instant::now());

        assert!(c.lookup(&request("/img/b.png"), Instant::now()).is_some());
        assert!(c.lookup(&request("/img/b.gif"), Instant::now()).is_none());
    }

    #[test]
    fn regex_capture_expansion() {
        let c = cache();
        let req = request("/thumb/abc.png");
        let mut response = local("/srv/placeholder");
        response.base = Some("/thumb/".into());
        response.regex = Some(r"^([a-z]+)\.png$".into());
        response.expand_path = Some(r"/srv/thumbs/\1.png".into());
        c.store(&req, response, Instant::now());

        let hit = c.lookup(&request("/thumb/xyz.png"), Instant::now()).unwrap();
        assert!(matches!(
            &hit.address,
            ResourceAddress::Local(f) if f.path == "/srv/thumbs/xyz.png"
        ));
    }

    #[test]
    fn invalidation_by_host() {
        let c = cache();
        let req = request("/page");
        c.store(&req, local("/srv/page"), Instant::now());
        assert!(c.lookup(&req, Instant::now()).is_some());

        c.invalidate(&req, &[TranslationCommand::Host]);
        assert!(c.lookup(&req, Instant::now()).is_none());
    }

    #[test]
    fn max_age_expires_entries() {
        let c = cache();
        let req = request("/page");
        let mut response = local("/srv/page");
        response.max_age = Some(std::time::Duration::from_secs(10));
        let now = Instant::now();
        c.store(&req, response, now);

        assert!(c.lookup(&req, now).is_some());
        assert!(c
            .lookup(&req, now + std::time::Duration::from_secs(11))
            .is_none());
    }

    #[test]
    fn expand_backreferences() {
        let re = regex::Regex::new(r"^(\w+)/(\w+)$").unwrap();
        let caps = re.captures("a/b").unwrap();
        assert_eq!(expand_captures(r"/x/\1/y/\2", &caps), "/x/a/y/b");
    }
}
