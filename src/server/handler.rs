use super::state::Instance;
use crate::access_log::AccessLogRecord;
use crate::error::ProxyError;
use crate::http1::server::RequestHandler;
use crate::http1::{headers, HttpResponse, IncomingRequest};
use crate::processor::{
    self, ProcessorEnv, PROCESSOR_CONTAINER, PROCESSOR_FOCUS_WIDGET, PROCESSOR_PREFIX_CSS_CLASS,
    PROCESSOR_PREFIX_XML_ID, PROCESSOR_REWRITE_URL, PROCESSOR_STYLE,
};
use crate::resource::loader::ResourceLoader;
use crate::resource::RequestEnv;
use crate::session::{SessionId, SessionLease};
use crate::translation::{TranslateRequest, TranslateResponse};
use crate::widget::Widget;
use http::{HeaderValue, Method, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

const SESSION_COOKIE: &str = "trellis_session";

/// The top-level request handler: consult the translation server, route
/// through cache and cluster to a backend, optionally run the widget
/// processor over the response, and account the request.
pub struct ProxyHandler {
    pub instance: Arc<Instance>,
}

impl RequestHandler for ProxyHandler {
    fn handle(
        &self,
        request: IncomingRequest,
    ) -> Pin<Box<dyn Future<Output = HttpResponse> + Send + '_>> {
        Box::pin(self.handle_request(request))
    }
}

/// Widget-addressing arguments carried in the template's query string.
#[derive(Debug, Default, PartialEq)]
struct WidgetArgs {
    focus: Option<String>,
    path: Option<String>,
    query: Option<String>,
    view: Option<String>,
    frame: Option<String>,
}

fn parse_widget_args(query: &str) -> WidgetArgs {
    let mut args = WidgetArgs::default();
    for pair in query.split('&') {
        let (name, value) = match pair.split_once('=') {
            Some(p) => p,
            None => (pair, ""),
        };
        let value = percent_decode(value);
        match name {
            "focus" => args.focus = Some(value),
            "path" => args.path = Some(value),
            "query" => args.query = Some(value),
            "view" => args.view = Some(value),
            "frame" => args.frame = Some(value),
            _ => {}
        }
    }
    args
}

/// CSS and text responses get their dedicated sub-processors when the
/// translation asked for them; everything else passes through.
fn apply_sub_processors(
    translated: &TranslateResponse,
    mut response: HttpResponse,
) -> HttpResponse {
    let content_type = response
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    let base = content_type
        .split(';')
        .next()
        .unwrap_or(&content_type)
        .trim()
        .to_string();

    if translated.process_css && base == "text/css" {
        if let Some(body) = response.body.take() {
            response.body = Some(Box::new(crate::processor::css::CssIstream::new(
                body, None, None,
            )));
            response.headers.remove(http::header::CONTENT_LENGTH);
        }
        return response;
    }

    if translated.process_text && crate::processor::text::is_text_type(&content_type) {
        if let Some(body) = response.body.take() {
            response.body = Some(Box::new(crate::processor::text::TextIstream::new(body)));
            response.headers.remove(http::header::CONTENT_LENGTH);
        }
    }
    response
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

impl ProxyHandler {
    async fn handle_request(&self, mut request: IncomingRequest) -> HttpResponse {
        let start = Instant::now();
        let instance = &self.instance;
        instance.stats.request_handled();

        let host = request.header("host").map(str::to_string);
        let referer = request.header("referer").map(str::to_string);
        let user_agent = request.header("user-agent").map(str::to_string);
        let xff = request.header("x-forwarded-for").map(str::to_string);
        let method_str = request.method.to_string();
        let uri_str = request.uri.clone();

        let (response, forwarded_to) = match self.run(&mut request).await {
            Ok(r) => r,
            Err(e) => {
                warn!("handler: request failed: {}", e);
                metrics::counter!("proxy_request_errors_total").increment(1);
                (
                    HttpResponse::message(e.status(), "request failed\n"),
                    None,
                )
            }
        };

        let content_length = response
            .body
            .as_ref()
            .and_then(|b| b.available(false))
            .unwrap_or(0);
        instance.access_logger.log(AccessLogRecord {
            site: host.clone(),
            forwarded_to,
            host,
            x_forwarded_for: xff,
            referer,
            user_agent,
            method: method_str,
            uri: uri_str,
            status: response.status.as_u16(),
            content_length,
            bytes_received: 0,
            bytes_sent: content_length,
            duration: start.elapsed(),
        });

        response
    }

    async fn run(
        &self,
        request: &mut IncomingRequest,
    ) -> Result<(HttpResponse, Option<String>), ProxyError> {
        let instance = &self.instance;

        let (path, query) = match request.uri.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (request.uri.clone(), None),
        };
        let widget_args = query.as_deref().map(parse_widget_args).unwrap_or_default();

        // session from cookie
        let session = self.load_session(request);
        let session_hex = session.as_ref().map(|s| s.id().to_hex());

        let host = request.header("host").map(str::to_string);
        let realm = host.clone().unwrap_or_else(|| "default".to_string());

        let translate_request = TranslateRequest {
            uri: path.clone(),
            host: host.clone(),
            session: session_hex,
            realm: Some(realm.clone()),
            ..Default::default()
        };
        let translated = instance.translation_cache.translate(&translate_request).await?;

        // a bare status / redirect answer bypasses dispatch
        if let Some(status) = translated.status {
            let mut response = HttpResponse::new(status, http::HeaderMap::new(), None);
            if let Some(location) = &translated.redirect {
                if let Ok(v) = HeaderValue::from_str(location) {
                    response
                        .headers
                        .insert(http::header::LOCATION, v);
                }
            }
            return Ok((response, None));
        }

        if !translated.address.is_defined() {
            return Ok((
                HttpResponse::message(StatusCode::NOT_FOUND, "no such site\n"),
                None,
            ));
        }

        // session-derived sticky hash keeps one client on one member
        let sticky_hash = session
            .as_ref()
            .map(|s| {
                let hex = s.id().to_hex();
                twox_hash::XxHash64::oneshot(0, hex.as_bytes())
            })
            .unwrap_or(0);

        let env = RequestEnv {
            sticky_hash,
            cache_tag: translated.cache_tag.clone(),
        };

        let mut backend_headers = request.headers.clone();
        headers::strip_hop_headers(&mut backend_headers);
        headers::append_forwarded_for(
            &mut backend_headers,
            &request.peer_addr.ip().to_string(),
        );

        let needs_processing = translated.process;
        let method = request.method.clone();
        let body = request.body.take();

        // the processor owns the body (it goes to the focused widget);
        // without processing it goes straight to the backend
        let (backend_body, processor_body) = if needs_processing {
            (None, body)
        } else {
            (body, None)
        };

        let modifying = crate::cache::rfc::request_invalidates(&method);

        let response = instance
            .loader
            .send_request(
                &translated.address,
                env,
                method.clone(),
                backend_headers,
                backend_body,
            )
            .await?;

        // flush tagged cache entries once a modifying request succeeded
        if translated.auto_flush_cache && modifying {
            if let Some(tag) = &translated.cache_tag {
                crate::cache::auto_flush_on_success(&instance.http_cache, tag.clone(), &response);
            }
        }

        let forwarded_to = Some(translated.address.id());

        if !needs_processing {
            let response = apply_sub_processors(&translated, response);
            return Ok((response, forwarded_to));
        }

        let response = self
            .process_response(
                request,
                &translated,
                response,
                path,
                widget_args,
                session,
                realm,
                method,
                processor_body,
            )
            .await?;
        Ok((response, forwarded_to))
    }

    fn load_session(&self, request: &IncomingRequest) -> Option<SessionLease> {
        let cookie_header = request.header("cookie")?;
        for cookie in cookie_header.split(';') {
            let (name, value) = cookie.trim().split_once('=')?;
            if name == SESSION_COOKIE {
                let id = SessionId::parse(value.trim())?;
                return self.instance.session_manager.find(id);
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_response(
        &self,
        request: &IncomingRequest,
        translated: &Arc<TranslateResponse>,
        response: HttpResponse,
        template_uri: String,
        widget_args: WidgetArgs,
        session: Option<SessionLease>,
        realm: String,
        method: Method,
        body: Option<crate::istream::BoxIstream>,
    ) -> Result<HttpResponse, ProxyError> {
        let instance = &self.instance;

        if response.status.is_client_error() || response.status.is_server_error() {
            // error documents pass through untouched
            return Ok(response);
        }

        let is_html = response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                let base = ct.split(';').next().unwrap_or(ct).trim();
                base == "text/html" || base == "text/xml" || base == "application/xhtml+xml"
            })
            .unwrap_or(false);
        if !is_html {
            debug!("handler: processor requested on non-HTML response");
            return Err(ProxyError::Widget(
                crate::error::WidgetErrorKind::WrongType,
                "<template>".into(),
            ));
        }

        // a session materialises as soon as stateful processing happens
        let session = match session {
            Some(s) => Some(s),
            None if translated.stateful => Some(instance.session_manager.create_session()),
            None => None,
        };
        let set_cookie = session.as_ref().map(|s| {
            format!(
                "{}={}; Path=/; HttpOnly",
                SESSION_COOKIE,
                s.id().to_hex()
            )
        });

        let mut options =
            PROCESSOR_REWRITE_URL | PROCESSOR_FOCUS_WIDGET | PROCESSOR_STYLE | PROCESSOR_CONTAINER;
        if !translated.container {
            options &= !PROCESSOR_CONTAINER;
        }
        if translated.prefix_css_class {
            options |= PROCESSOR_PREFIX_CSS_CLASS;
        }
        if translated.prefix_xml_id {
            options |= PROCESSOR_PREFIX_XML_ID;
        }

        let env = Arc::new(ProcessorEnv {
            loader: instance.loader.clone(),
            translation: instance.translation_cache.clone(),
            template_uri,
            request_headers: request.headers.clone(),
            request_method: method,
            request_body: Arc::new(Mutex::new(body)),
            focus: widget_args.focus,
            focus_path_info: widget_args.path,
            focus_query: widget_args.query,
            focus_view: widget_args.view,
            session: session.as_ref().map(|s| s.clone_ref()),
            realm,
        });

        let root = Widget::new_root();
        let body = response
            .body
            .unwrap_or_else(crate::istream::empty);
        let processed = processor::process(body, root, env, options);

        let mut headers = response.headers;
        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::CONTENT_ENCODING);
        if let Some(cookie) = set_cookie {
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                headers.append(http::header::SET_COOKIE, v);
            }
        }

        Ok(HttpResponse::new(response.status, headers, Some(processed)))
    }
}
