use super::{resolver, Widget};
use crate::error::{ProxyError, WidgetErrorKind};
use crate::http1::HttpResponse;
use crate::istream::{DeferredFill, IstreamError};
use crate::processor::{
    self, ProcessorEnv, PROCESSOR_CONTAINER, PROCESSOR_FOCUS_WIDGET, PROCESSOR_PREFIX_CSS_CLASS,
    PROCESSOR_PREFIX_XML_ID, PROCESSOR_REWRITE_URL, PROCESSOR_STYLE,
};
use crate::resource::{RequestEnv, ResourceAddress};
use crate::translation::{HeaderForwardMode, HeaderForwardSettings, View};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::sync::Arc;
use tracing::debug;

/// Fetch an embedded widget and fulfil the deferred stream spliced into
/// the template. Failures surface as a stream error which the enclosing
/// catch converts into an empty fragment.
pub async fn build_inline_widget(env: Arc<ProcessorEnv>, mut widget: Widget, fill: DeferredFill) {
    if fill.is_abandoned() {
        return;
    }
    match run_widget_request(&env, &mut widget).await {
        Ok(body) => match body {
            Some(body) => fill.set(body),
            None => fill.set(crate::istream::empty()),
        },
        Err(e) => {
            metrics::counter!("proxy_widget_errors_total").increment(1);
            fill.fail(IstreamError::other(e));
        }
    }
}

async fn run_widget_request(
    env: &Arc<ProcessorEnv>,
    widget: &mut Widget,
) -> Result<Option<crate::istream::BoxIstream>, ProxyError> {
    resolver::resolve_widget_class(&env.translation, widget).await?;
    let class = widget.class.clone().expect("class resolved");

    let widget_name = widget
        .id_path
        .clone()
        .unwrap_or_else(|| "<anonymous>".to_string());

    // pick the view: the request may select one, the widget declaration
    // may, else the default
    let view_name = widget
        .from_request
        .as_ref()
        .and_then(|fr| fr.view.clone())
        .or_else(|| widget.view_name.clone());
    let view = class
        .view(view_name.as_deref())
        .or_else(|| {
            if view_name.is_some() {
                None
            } else {
                class.views.first()
            }
        })
        .ok_or_else(|| {
            ProxyError::Widget(WidgetErrorKind::NoSuchView, widget_name.clone())
        })?
        .clone();

    if !view.address.is_defined() {
        return Err(ProxyError::Widget(
            WidgetErrorKind::Unspecified,
            widget_name.clone(),
        ));
    }

    let address = apply_widget_location(&view.address, widget);
    let headers = build_request_headers(env, widget, &view);

    let (method, body) = match widget.from_request.as_mut() {
        Some(fr) => (fr.method.clone(), fr.body.take()),
        None => (Method::GET, None),
    };

    let response = env
        .loader
        .send_request(&address, RequestEnv::default(), method, headers, body)
        .await?;

    check_response(env, widget, &class, response).map(Some)
}

/// Apply the widget's path-info and query string to its class address.
fn apply_widget_location(address: &ResourceAddress, widget: &Widget) -> ResourceAddress {
    let path_info = widget
        .from_request
        .as_ref()
        .and_then(|fr| fr.path_info.clone())
        .or_else(|| widget.path_info.clone());
    let query = merge_query(widget);

    match address {
        ResourceAddress::Http(a) => {
            let mut a = a.clone();
            if let Some(pi) = &path_info {
                // the widget path is appended below the class path
                if a.path.ends_with('/') && pi.starts_with('/') {
                    a.path.pop();
                }
                a.path.push_str(pi);
            }
            if let Some(q) = &query {
                a.path.push(if a.path.contains('?') { '&' } else { '?' });
                a.path.push_str(q);
            }
            ResourceAddress::Http(a)
        }
        ResourceAddress::Lhttp(a) => {
            let mut a = a.clone();
            if let Some(pi) = &path_info {
                if a.uri.ends_with('/') && pi.starts_with('/') {
                    a.uri.pop();
                }
                a.uri.push_str(pi);
            }
            if let Some(q) = &query {
                a.uri.push(if a.uri.contains('?') { '&' } else { '?' });
                a.uri.push_str(q);
            }
            ResourceAddress::Lhttp(a)
        }
        ResourceAddress::Cgi(a) | ResourceAddress::FastCgi(a) | ResourceAddress::Was(a) => {
            let mut b = a.clone();
            if path_info.is_some() {
                b.path_info = path_info;
            }
            if query.is_some() {
                b.query_string = query;
            }
            match address {
                ResourceAddress::Cgi(_) => ResourceAddress::Cgi(b),
                ResourceAddress::FastCgi(_) => ResourceAddress::FastCgi(b),
                _ => ResourceAddress::Was(b),
            }
        }
        other => other.clone(),
    }
}

/// The widget's `c:param` query string plus the focused request's query.
fn merge_query(widget: &Widget) -> Option<String> {
    let from_request = widget
        .from_request
        .as_ref()
        .and_then(|fr| fr.query_string.as_deref());
    match (widget.query_string.as_deref(), from_request) {
        (Some(a), Some(b)) => Some(format!("{}&{}", a, b)),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}

/// Assemble the sub-request headers: the view's forward policy applied
/// to the inbound headers, plus the widget's own `c:header` values.
fn build_request_headers(env: &ProcessorEnv, widget: &Widget, view: &View) -> HeaderMap {
    let mut headers = forward_request_headers(&env.request_headers, &view.request_header_forward);
    for (name, value) in &widget.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(
        HeaderName::from_static("accept-encoding"),
        HeaderValue::from_static("identity"),
    );
    headers
}

pub fn forward_request_headers(
    inbound: &HeaderMap,
    settings: &HeaderForwardSettings,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let group = header_group(name.as_str());
        let mode = match group {
            HeaderGroup::Identity => settings.identity,
            HeaderGroup::Capabilities => settings.capabilities,
            HeaderGroup::Cookie => settings.cookie,
            HeaderGroup::Other => settings.other,
            HeaderGroup::Never => HeaderForwardMode::No,
        };
        match mode {
            HeaderForwardMode::No => {}
            HeaderForwardMode::Yes | HeaderForwardMode::Mangle => {
                out.append(name.clone(), value.clone());
            }
        }
    }
    out
}

enum HeaderGroup {
    Identity,
    Capabilities,
    Cookie,
    Other,
    /// hop-by-hop and framing headers never cross the widget boundary
    Never,
}

fn header_group(name: &str) -> HeaderGroup {
    match name {
        "authorization" | "x-forwarded-for" | "x-real-ip" | "from" => HeaderGroup::Identity,
        "accept" | "accept-language" | "accept-charset" | "user-agent" => {
            HeaderGroup::Capabilities
        }
        "cookie" | "cookie2" => HeaderGroup::Cookie,
        "host" | "connection" | "content-length" | "content-type" | "transfer-encoding"
        | "expect" | "upgrade" | "accept-encoding" | "range" | "te" | "trailer" => {
            HeaderGroup::Never
        }
        _ => HeaderGroup::Other,
    }
}

/// Validate the widget response and decide whether to recurse into the
/// processor.
fn check_response(
    env: &Arc<ProcessorEnv>,
    widget: &Widget,
    class: &Arc<crate::translation::TranslateResponse>,
    response: HttpResponse,
) -> Result<crate::istream::BoxIstream, ProxyError> {
    let widget_name = widget
        .id_path
        .clone()
        .unwrap_or_else(|| "<anonymous>".to_string());

    if let Some(encoding) = response
        .headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        if encoding != "identity" {
            return Err(ProxyError::Widget(
                WidgetErrorKind::UnsupportedEncoding,
                widget_name,
            ));
        }
    }

    let body = response.body.unwrap_or_else(crate::istream::empty);

    if !class.process {
        // raw fragment: spliced verbatim
        return Ok(body);
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
        return Err(ProxyError::Widget(WidgetErrorKind::WrongType, widget_name));
    }

    // recurse: the widget's own response may declare more widgets
    let mut options = PROCESSOR_REWRITE_URL | PROCESSOR_FOCUS_WIDGET | PROCESSOR_STYLE;
    if class.container {
        options |= PROCESSOR_CONTAINER;
    }
    if class.prefix_css_class {
        options |= PROCESSOR_PREFIX_CSS_CLASS;
    }
    if class.prefix_xml_id {
        options |= PROCESSOR_PREFIX_XML_ID;
    }

    let child_env = Arc::new(ProcessorEnv {
        loader: env.loader.clone(),
        translation: env.translation.clone(),
        template_uri: env.template_uri.clone(),
        request_headers: env.request_headers.clone(),
        request_method: env.request_method.clone(),
        request_body: env.request_body.clone(),
        focus: env.focus.clone(),
        focus_path_info: env.focus_path_info.clone(),
        focus_query: env.focus_query.clone(),
        focus_view: env.focus_view.clone(),
        session: env.session.as_ref().map(|s| s.clone_ref()),
        realm: env.realm.clone(),
    });

    let container = super::Widget {
        class_name: widget.class_name.clone(),
        class: Some(class.clone()),
        id: widget.id.clone(),
        id_path: widget.id_path.clone(),
        display: widget.display,
        session_scope: widget.session_scope,
        query_string: None,
        headers: Vec::new(),
        path_info: None,
        view_name: widget.view_name.clone(),
        from_request: None,
    };

    debug!("widget '{}': processing embedded response", widget_name);
    Ok(processor::process(body, container, child_env, options))
}
