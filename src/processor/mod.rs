pub mod css;
pub mod escape;
pub mod parser;
pub mod text;

use crate::istream::{
    deferred, BoxIstream, CatchIstream, Istream, IstreamError, ReplaceControl, ReplaceIstream,
};
use crate::resource::ResourceLoader;
use crate::session::SessionLease;
use crate::translation::TranslationCache;
use crate::widget::rewrite::{rewrite_widget_uri, RewriteMode};
use crate::widget::{FromRequest, Widget, WidgetDisplay, WidgetSessionScope};
use bytes::Bytes;
use http::{HeaderMap, Method};
use parser::{TagKind, XmlAttr, XmlParser, XmlParserHandler, XmlTag};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::debug;

pub const PROCESSOR_CONTAINER: u32 = 0x1;
pub const PROCESSOR_REWRITE_URL: u32 = 0x2;
pub const PROCESSOR_PREFIX_CSS_CLASS: u32 = 0x4;
pub const PROCESSOR_PREFIX_XML_ID: u32 = 0x8;
pub const PROCESSOR_FOCUS_WIDGET: u32 = 0x10;
pub const PROCESSOR_STYLE: u32 = 0x20;

/// Everything a processing run (and the widget sub-requests it spawns)
/// needs from the surrounding request.
pub struct ProcessorEnv {
    pub loader: Arc<dyn ResourceLoader>,
    pub translation: Arc<TranslationCache>,
    /// URI under which the template was requested; focus links point
    /// back at it
    pub template_uri: String,
    pub request_headers: HeaderMap,
    pub request_method: Method,
    /// the inbound request body; taken once by the focused widget,
    /// shared across nested processing runs
    pub request_body: Arc<Mutex<Option<BoxIstream>>>,
    /// id path of the widget that owns the current request
    pub focus: Option<String>,
    pub focus_path_info: Option<String>,
    pub focus_query: Option<String>,
    pub focus_view: Option<String>,
    pub session: Option<SessionLease>,
    pub realm: String,
}

impl ProcessorEnv {
    fn take_request_body(&self) -> Option<BoxIstream> {
        self.request_body.lock().unwrap().take()
    }
}

/// Run the HTML processor over `input`: discover embedded widgets,
/// forward focus to exactly one of them, rewrite link attributes and
/// splice each widget's rendered response into the output.
pub fn process(
    input: BoxIstream,
    container: Widget,
    env: Arc<ProcessorEnv>,
    options: u32,
) -> BoxIstream {
    let control = ReplaceControl::new();
    let handler = XmlProcessor::new(container, env, options, control.clone());
    let stream = ProcessorStream {
        input,
        parser: XmlParser::new(),
        handler,
        finished: false,
    };
    Box::new(ReplaceIstream::with_control(&control, Box::new(stream)))
}

/// Run the parser only until the widget with the given id has been
/// declared, and return it; used to recurse into a nested widget as part
/// of a single request. Produces no output.
pub async fn lookup_widget(
    mut input: BoxIstream,
    container: &Widget,
    id: &str,
) -> Result<Option<Widget>, IstreamError> {
    let mut parser = XmlParser::new();
    let mut handler = LookupHandler {
        builder: WidgetBuilder::new(container.id_path.clone()),
        target: id.to_string(),
        found: None,
    };
    loop {
        match crate::istream::next_chunk(input.as_mut()).await {
            Some(Ok(chunk)) => {
                parser.feed(&chunk, &mut handler);
                if handler.found.is_some() {
                    return Ok(handler.found);
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        }
    }
}

/// Pass-through stream that tokenizes the bytes flowing through it and
/// drives the processor, which in turn steers the surrounding
/// `ReplaceIstream`.
struct ProcessorStream {
    input: BoxIstream,
    parser: XmlParser,
    handler: XmlProcessor,
    finished: bool,
}

impl Istream for ProcessorStream {
    fn available(&self, partial: bool) -> Option<u64> {
        if partial {
            self.input.available(true)
        } else {
            None
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        match self.input.poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.parser.feed(&chunk, &mut self.handler);
                let settle = self
                    .parser
                    .settled_position()
                    .min(self.handler.hold_floor());
                self.handler.control.settle(settle);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if !self.finished {
                    self.finished = true;
                    self.handler.on_input_eof();
                    self.handler.control.finish();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Accumulates the attributes of an open `<c:widget>` element and its
/// parameter children.
struct WidgetBuilder {
    parent_id_path: Option<String>,
    widget: Option<Widget>,
    start: u64,
    /// nested `<c:widget>` elements are ignored but must balance
    depth: u32,
    /// attrs of the parameter element currently open
    param_name: Option<String>,
    param_value: Option<String>,
}

impl WidgetBuilder {
    fn new(parent_id_path: Option<String>) -> Self {
        Self {
            parent_id_path,
            widget: None,
            start: 0,
            depth: 0,
            param_name: None,
            param_value: None,
        }
    }

    fn open(&mut self, start: u64) {
        self.widget = Some(Widget::new_child(self.parent_id_path.as_deref(), None));
        self.start = start;
    }

    fn apply_widget_attr(&mut self, attr: &XmlAttr) {
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        match attr.name.as_str() {
            "type" => widget.class_name = Some(attr.value.clone()),
            "id" => {
                widget.id = Some(attr.value.clone());
                *widget = rebuild_with_id(widget, self.parent_id_path.as_deref());
            }
            "display" => {
                widget.display = if attr.value == "none" {
                    WidgetDisplay::None
                } else {
                    WidgetDisplay::Inline
                };
            }
            "session" => {
                widget.session_scope = if attr.value == "site" {
                    WidgetSessionScope::Site
                } else {
                    WidgetSessionScope::Resource
                };
            }
            _ => {}
        }
    }

    fn finish_param(&mut self, element: &str) {
        let Some(widget) = self.widget.as_mut() else {
            return;
        };
        let name = self.param_name.take();
        let value = self.param_value.take();
        if name.is_none() && value.is_none() {
            // the closing tag of an element whose attributes were
            // already consumed at the opening tag
            return;
        }
        let value = value.unwrap_or_default();
        match element {
            "c:param" => {
                if let Some(name) = name {
                    widget.add_param(&name, &value);
                }
            }
            "c:header" => {
                if let Some(name) = name {
                    if !widget.add_header(&name, &value) {
                        debug!("processor: rejecting header '{}' on widget", name);
                    }
                }
            }
            "c:path-info" => widget.path_info = Some(value),
            "c:view" => widget.view_name = Some(value),
            _ => {}
        }
    }
}

fn rebuild_with_id(widget: &Widget, parent_id_path: Option<&str>) -> Widget {
    let mut fresh = Widget::new_child(parent_id_path, widget.id.clone());
    fresh.class_name = widget.class_name.clone();
    fresh.display = widget.display;
    fresh.session_scope = widget.session_scope;
    fresh.query_string = widget.query_string.clone();
    fresh.headers = widget.headers.clone();
    fresh.path_info = widget.path_info.clone();
    fresh.view_name = widget.view_name.clone();
    fresh
}

fn is_widget_param_element(name: &str) -> bool {
    matches!(name, "c:param" | "c:header" | "c:path-info" | "c:view")
}

/// Which attribute carries the link for each rewritable element.
fn uri_attribute(tag: &str) -> Option<&'static str> {
    Some(match tag {
        "a" | "link" => "href",
        "form" => "action",
        "img" | "script" | "iframe" | "embed" | "video" | "audio" => "src",
        "param" => "value",
        _ => return None,
    })
}

/// State of the element currently between `<` and `>`.
struct TagState {
    name: String,
    /// the value of the link-bearing attribute, decision postponed until
    /// the tag closes
    uri_value: Option<(String, u64, u64)>,
    mode: Option<RewriteMode>,
    view: Option<String>,
    /// ranges of c:mode/c:base/c:view attributes, deleted on tag close
    delete_ranges: Vec<(u64, u64)>,
    /// prefix rewrites of class/id/for/name attributes
    rewrites: Vec<(u64, u64, String)>,
}

struct StyleCapture {
    content_start: u64,
    buf: Vec<u8>,
}

struct XmlProcessor {
    container: Widget,
    env: Arc<ProcessorEnv>,
    options: u32,
    control: ReplaceControl,

    builder: WidgetBuilder,
    tag: Option<TagState>,
    style: Option<StyleCapture>,
    /// lower bound for settle while a widget element or style block is
    /// open
    hold: Option<u64>,
    /// a focused widget was seen in this tree
    focus_taken: bool,
}

impl XmlProcessor {
    fn new(
        container: Widget,
        env: Arc<ProcessorEnv>,
        options: u32,
        control: ReplaceControl,
    ) -> Self {
        let builder = WidgetBuilder::new(container.id_path.clone());
        Self {
            container,
            env,
            options,
            control,
            builder,
            tag: None,
            style: None,
            hold: None,
            focus_taken: false,
        }
    }

    fn has(&self, option: u32) -> bool {
        self.options & option != 0
    }

    fn hold_floor(&self) -> u64 {
        self.hold.unwrap_or(u64::MAX)
    }

    fn on_input_eof(&mut self) {
        if let Some(builder_widget) = self.builder.widget.take() {
            // unterminated widget element: drop it, delete what we saw
            debug!(
                "processor: widget element not terminated, id={:?}",
                builder_widget.id
            );
        }
        self.hold = None;
    }

    /// Replace the widget element's byte range with the embedded
    /// widget's rendered output.
    fn embed(&mut self, mut widget: Widget, start: u64, end: u64) {
        self.hold = None;

        if !self.has(PROCESSOR_CONTAINER) {
            debug!("processor: widget in non-container response, dropping");
            self.control.add(start, end, None);
            return;
        }
        if widget.display == WidgetDisplay::None {
            self.control.add(start, end, None);
            return;
        }

        // exactly one widget receives the request's focus
        if self.has(PROCESSOR_FOCUS_WIDGET) && !self.focus_taken {
            if let (Some(focus), Some(id_path)) =
                (self.env.focus.as_deref(), widget.id_path.as_deref())
            {
                if focus == id_path {
                    self.focus_taken = true;
                    widget.from_request = Some(FromRequest {
                        method: self.env.request_method.clone(),
                        body: self.env.take_request_body(),
                        query_string: self.env.focus_query.clone(),
                        path_info: self.env.focus_path_info.clone(),
                        view: self.env.focus_view.clone(),
                    });
                }
            }
        }

        // the focused widget's state is saved to the session once its
        // element is complete
        if let (Some(session), Some(id_path)) = (&self.env.session, &widget.id_path) {
            if widget.is_focused() {
                let realm = self.env.realm.clone();
                let path_info = widget
                    .from_request
                    .as_ref()
                    .and_then(|fr| fr.path_info.clone());
                let query_string = widget
                    .from_request
                    .as_ref()
                    .and_then(|fr| fr.query_string.clone());
                let id_path = id_path.clone();
                session.with(move |s| {
                    let w = s.realm(&realm).widgets.entry(id_path).or_default();
                    w.path_info = path_info;
                    w.query_string = query_string;
                });
            }
        }

        let (fill, stream) = deferred();
        let widget_name = widget
            .id_path
            .clone()
            .unwrap_or_else(|| "<anonymous>".to_string());
        let catch = CatchIstream::new(Box::new(stream), move |e| {
            debug!("widget '{}' failed: {}", widget_name, e);
        });
        self.control.add(start, end, Some(Box::new(catch)));

        let env = self.env.clone();
        tokio::spawn(async move {
            crate::widget::request::build_inline_widget(env, widget, fill).await;
        });
        metrics::counter!("proxy_widgets_embedded_total").increment(1);
    }

}

impl XmlParserHandler for XmlProcessor {
    fn on_tag_start(&mut self, tag: &XmlTag) -> bool {
        if self.builder.widget.is_some() {
            // inside a widget element only parameter elements matter
            return tag.name == "c:widget" || is_widget_param_element(&tag.name);
        }
        if tag.name == "c:widget" {
            if tag.kind != TagKind::Close {
                self.builder.open(tag.start);
                self.hold = Some(tag.start);
            }
            return true;
        }
        if tag.name == "style" && self.has(PROCESSOR_STYLE) {
            return true;
        }
        let rewritable =
            self.has(PROCESSOR_REWRITE_URL) && uri_attribute(&tag.name).is_some();
        let prefixing =
            self.has(PROCESSOR_PREFIX_CSS_CLASS) || self.has(PROCESSOR_PREFIX_XML_ID);
        if rewritable || prefixing {
            self.tag = Some(TagState {
                name: tag.name.clone(),
                uri_value: None,
                mode: None,
                view: None,
                delete_ranges: Vec::new(),
                rewrites: Vec::new(),
            });
            return true;
        }
        false
    }

    fn on_attribute(&mut self, attr: &XmlAttr) {
        if self.builder.widget.is_some() {
            if self.builder.depth == 0 {
                match attr.name.as_str() {
                    "name" => self.builder.param_name = Some(attr.value.clone()),
                    "value" => self.builder.param_value = Some(attr.value.clone()),
                    _ => self.builder.apply_widget_attr(attr),
                }
            }
            return;
        }

        let Some(tag_state) = self.tag.as_mut() else {
            return;
        };

        // postponed URI decision: c:* attributes in the same tag replace
        // the defaults
        match attr.name.as_str() {
            "c:mode" => {
                tag_state.mode = RewriteMode::parse(&attr.value);
                tag_state.delete_ranges.push(attr.full_range());
                return;
            }
            "c:base" => {
                // only the widget base is supported; the attribute is
                // consumed either way
                tag_state.delete_ranges.push(attr.full_range());
                return;
            }
            "c:view" => {
                tag_state.view = Some(attr.value.clone());
                tag_state.delete_ranges.push(attr.full_range());
                return;
            }
            _ => {}
        }

        if self.options & PROCESSOR_REWRITE_URL != 0 {
            if let Some(uri_attr) = uri_attribute(&tag_state.name) {
                if attr.name == uri_attr {
                    tag_state.uri_value =
                        Some((attr.value.clone(), attr.value_start, attr.value_end));
                    return;
                }
            }
        }

        let prefix = self.container.prefix();
        let class_name = self.container.quoted_class_name().map(str::to_string);

        if self.options & PROCESSOR_PREFIX_CSS_CLASS != 0 && attr.name == "class" {
            if let Some(rewritten) =
                css::prefix_class_value(&attr.value, prefix.as_deref(), class_name.as_deref())
            {
                tag_state
                    .rewrites
                    .push((attr.value_start, attr.value_end, rewritten));
            }
            return;
        }

        if self.options & PROCESSOR_PREFIX_XML_ID != 0
            && matches!(attr.name.as_str(), "id" | "for" | "name")
        {
            if let Some(rewritten) =
                css::prefix_identifier(&attr.value, prefix.as_deref(), class_name.as_deref())
            {
                tag_state
                    .rewrites
                    .push((attr.value_start, attr.value_end, rewritten));
            }
        }
    }

    fn on_tag_finished(&mut self, tag: &XmlTag) {
        if tag.name == "c:widget" {
            match tag.kind {
                TagKind::Open if self.builder.widget.is_some() && self.builder.start != tag.start => {
                    // nested widget element: not supported, balance it
                    self.builder.depth += 1;
                }
                TagKind::Short => {
                    if let Some(widget) = self.builder.widget.take() {
                        self.embed(widget, self.builder.start, tag.end);
                    }
                }
                TagKind::Close => {
                    if self.builder.depth > 0 {
                        self.builder.depth -= 1;
                    } else if let Some(widget) = self.builder.widget.take() {
                        self.embed(widget, self.builder.start, tag.end);
                    }
                }
                TagKind::Open => {}
            }
            return;
        }

        if self.builder.widget.is_some() {
            if is_widget_param_element(&tag.name)
                && (tag.kind == TagKind::Short || tag.kind == TagKind::Close)
                && self.builder.depth == 0
            {
                self.builder.finish_param(&tag.name);
            }
            return;
        }

        if tag.name == "style" && self.has(PROCESSOR_STYLE) {
            match tag.kind {
                TagKind::Open => {
                    self.style = Some(StyleCapture {
                        content_start: tag.end,
                        buf: Vec::new(),
                    });
                    self.hold = Some(tag.end);
                }
                TagKind::Close => {
                    if let Some(capture) = self.style.take() {
                        self.hold = None;
                        let source = String::from_utf8_lossy(&capture.buf);
                        let processed = css::process_css(
                            &source,
                            self.container.prefix().as_deref(),
                            self.container.quoted_class_name(),
                            |uri| {
                                rewrite_widget_uri(
                                    &self.container,
                                    &self.env.template_uri,
                                    RewriteMode::Focus,
                                    uri,
                                    None,
                                )
                            },
                        );
                        if processed != source.as_ref() {
                            self.control.add(
                                capture.content_start,
                                tag.start,
                                Some(crate::istream::from_bytes(processed)),
                            );
                        }
                    }
                }
                TagKind::Short => {}
            }
            return;
        }

        if let Some(mut tag_state) = self.tag.take() {
            // all replacements of a tag are issued in source order
            let mut edits: Vec<(u64, u64, Option<String>)> = Vec::new();
            for (start, end) in tag_state.delete_ranges.drain(..) {
                edits.push((start, end, None));
            }
            for (start, end, value) in tag_state.rewrites.drain(..) {
                edits.push((start, end, Some(escape::html_escape(&value))));
            }
            if let Some((value, start, end)) = tag_state.uri_value.take() {
                let mode = tag_state.mode.unwrap_or_default();
                if let Some(rewritten) = rewrite_widget_uri(
                    &self.container,
                    &self.env.template_uri,
                    mode,
                    &value,
                    tag_state.view.as_deref(),
                ) {
                    edits.push((start, end, Some(escape::html_escape(&rewritten))));
                }
            }
            edits.sort_by_key(|(start, _, _)| *start);
            for (start, end, replacement) in edits {
                self.control
                    .add(start, end, replacement.map(crate::istream::from_bytes));
            }
        }
    }

    fn on_cdata(&mut self, data: &[u8], _start: u64) {
        if let Some(capture) = self.style.as_mut() {
            capture.buf.extend_from_slice(data);
        }
    }
}

/// Handler for lookup mode: build widgets but produce nothing; stop at
/// the first widget whose id matches.
struct LookupHandler {
    builder: WidgetBuilder,
    target: String,
    found: Option<Widget>,
}

impl XmlParserHandler for LookupHandler {
    fn on_tag_start(&mut self, tag: &XmlTag) -> bool {
        if tag.name == "c:widget" {
            if tag.kind != TagKind::Close && self.builder.widget.is_none() {
                self.builder.open(tag.start);
            }
            return true;
        }
        is_widget_param_element(&tag.name) && self.builder.widget.is_some()
    }

    fn on_attribute(&mut self, attr: &XmlAttr) {
        if self.builder.widget.is_some() {
            match attr.name.as_str() {
                "name" => self.builder.param_name = Some(attr.value.clone()),
                "value" => self.builder.param_value = Some(attr.value.clone()),
                _ => self.builder.apply_widget_attr(attr),
            }
        }
    }

    fn on_tag_finished(&mut self, tag: &XmlTag) {
        if self.found.is_some() {
            return;
        }
        if tag.name == "c:widget" && (tag.kind == TagKind::Close || tag.kind == TagKind::Short) {
            if let Some(widget) = self.builder.widget.take() {
                if widget.id.as_deref() == Some(self.target.as_str()) {
                    self.found = Some(widget);
                }
            }
        } else if self.builder.widget.is_some() && is_widget_param_element(&tag.name) {
            self.builder.finish_param(&tag.name);
        }
    }

    fn on_cdata(&mut self, _data: &[u8], _start: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::from_bytes;

    fn root_env() -> Arc<ProcessorEnv> {
        Arc::new(ProcessorEnv {
            loader: Arc::new(NullLoader),
            translation: crate::translation::TranslationCache::new(
                crate::translation::TranslationStock::new("/nonexistent".into(), 1),
                8,
            ),
            template_uri: "/page.html".into(),
            request_headers: HeaderMap::new(),
            request_method: Method::GET,
            request_body: Arc::new(Mutex::new(None)),
            focus: None,
            focus_path_info: None,
            focus_query: None,
            focus_view: None,
            session: None,
            realm: "test".into(),
        })
    }

    struct NullLoader;

    impl ResourceLoader for NullLoader {
        fn send_request<'a>(
            &'a self,
            _address: &'a crate::resource::ResourceAddress,
            _env: crate::resource::RequestEnv,
            _method: Method,
            _headers: HeaderMap,
            _body: Option<BoxIstream>,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<crate::http1::HttpResponse, crate::error::ProxyError>,
                    > + Send
                    + 'a,
            >,
        > {
            Box::pin(async {
                Ok(crate::http1::HttpResponse::message(
                    http::StatusCode::OK,
                    "widget body",
                ))
            })
        }
    }

    async fn run(input: &str, container: Widget, options: u32) -> String {
        let out = process(
            from_bytes(input.to_string()),
            container,
            root_env(),
            options,
        );
        let bytes = crate::istream::collect(out).await.unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    fn widget_container(id: &str) -> Widget {
        let mut w = Widget::new_child(Some(""), Some(id.to_string()));
        w.class_name = Some("shop".into());
        w
    }

    #[tokio::test]
    async fn passthrough_without_markup() {
        let out = run("<p>plain</p>", Widget::new_root(), PROCESSOR_CONTAINER).await;
        assert_eq!(out, "<p>plain</p>");
    }

    #[tokio::test]
    async fn widget_element_is_replaced() {
        let out = run(
            r#"A<c:widget type="x" id="w1" display="none"></c:widget>B"#,
            Widget::new_root(),
            PROCESSOR_CONTAINER,
        )
        .await;
        // display=none deletes the element without a sub-request
        assert_eq!(out, "AB");
    }

    #[tokio::test]
    async fn widget_outside_container_is_dropped() {
        let out = run(
            r#"A<c:widget type="x" id="w1"/>B"#,
            Widget::new_root(),
            0,
        )
        .await;
        assert_eq!(out, "AB");
    }

    #[tokio::test]
    async fn link_rewriting_in_widget_content() {
        let out = run(
            r#"<a href="/detail">x</a>"#,
            widget_container("shop1"),
            PROCESSOR_CONTAINER | PROCESSOR_REWRITE_URL,
        )
        .await;
        assert_eq!(
            out,
            r#"<a href="/page.html?focus=shop1&amp;path=%2Fdetail">x</a>"#
        );
    }

    #[tokio::test]
    async fn mode_attribute_overrides_and_is_deleted() {
        let out = run(
            r##"<a href="#frag" c:mode="direct">x</a>"##,
            widget_container("w"),
            PROCESSOR_CONTAINER | PROCESSOR_REWRITE_URL,
        )
        .await;
        // fragments stay untouched, but the c:mode attribute is removed
        assert_eq!(out, r##"<a href="#frag" >x</a>"##);
    }

    #[tokio::test]
    async fn class_prefixing() {
        let out = run(
            r#"<div class="__box _plain ___deep">x</div>"#,
            widget_container("w1"),
            PROCESSOR_CONTAINER | PROCESSOR_PREFIX_CSS_CLASS,
        )
        .await;
        assert_eq!(out, r#"<div class="shop__box _plain w1___deep">x</div>"#);
    }

    #[tokio::test]
    async fn id_attribute_prefixing() {
        let out = run(
            r#"<label for="__field">x</label>"#,
            widget_container("w1"),
            PROCESSOR_CONTAINER | PROCESSOR_PREFIX_XML_ID,
        )
        .await;
        assert_eq!(out, r#"<label for="shop__field">x</label>"#);
    }

    #[tokio::test]
    async fn root_template_links_untouched() {
        let input = r#"<a href="/x">y</a>"#;
        let out = run(
            input,
            Widget::new_root(),
            PROCESSOR_CONTAINER | PROCESSOR_REWRITE_URL,
        )
        .await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn lookup_finds_widget_with_params() {
        let input = r#"
            <c:widget type="a" id="first"/>
            <c:widget type="b" id="second">
              <c:param name="k" value="v"/>
              <c:path-info value="/sub"/>
            </c:widget>"#;
        let root = Widget::new_root();
        let found = lookup_widget(from_bytes(input.to_string()), &root, "second")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.class_name.as_deref(), Some("b"));
        assert_eq!(found.id_path.as_deref(), Some("second"));
        assert_eq!(found.query_string.as_deref(), Some("k=v"));
        assert_eq!(found.path_info.as_deref(), Some("/sub"));
    }

    #[tokio::test]
    async fn lookup_misses() {
        let input = r#"<c:widget type="a" id="one"/>"#;
        let root = Widget::new_root();
        assert!(lookup_widget(from_bytes(input.to_string()), &root, "other")
            .await
            .unwrap()
            .is_none());
    }

    /// A loader that records each sub-request and answers by path.
    struct RecordingLoader {
        seen: Mutex<Vec<(String, Method, usize)>>,
    }

    impl ResourceLoader for RecordingLoader {
        fn send_request<'a>(
            &'a self,
            address: &'a crate::resource::ResourceAddress,
            _env: crate::resource::RequestEnv,
            method: Method,
            _headers: HeaderMap,
            body: Option<BoxIstream>,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<crate::http1::HttpResponse, crate::error::ProxyError>,
                    > + Send
                    + 'a,
            >,
        > {
            let path = match address {
                crate::resource::ResourceAddress::Http(a) => a.path.clone(),
                _ => String::new(),
            };
            Box::pin(async move {
                let body_len = match body {
                    Some(b) => crate::istream::collect(b).await.unwrap().len(),
                    None => 0,
                };
                self.seen.lock().unwrap().push((path.clone(), method, body_len));

                let mut headers = HeaderMap::new();
                let (content_type, payload): (&str, String) =
                    if path.starts_with("/outer-widget") {
                        (
                            "text/html",
                            r#"[outer <c:widget type="inner-class" id="inner"/>]"#.into(),
                        )
                    } else {
                        ("text/plain", "INNER".into())
                    };
                headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static(match content_type {
                        "text/html" => "text/html",
                        _ => "text/plain",
                    }),
                );
                Ok(crate::http1::HttpResponse::new(
                    http::StatusCode::OK,
                    headers,
                    Some(crate::istream::from_bytes(payload)),
                ))
            })
        }
    }

    fn widget_class(path: &str, process: bool, container: bool) -> TranslateResponse {
        use crate::resource::{HttpAddress, ResourceAddress};
        use crate::translation::View;
        TranslateResponse {
            process,
            container,
            views: vec![View {
                name: None,
                address: ResourceAddress::Http(HttpAddress {
                    https: false,
                    host_and_port: "widgets".into(),
                    path: path.into(),
                    addresses: vec![],
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    use crate::translation::{TranslateRequest, TranslateResponse};

    /// Template embeds `outer`, whose own response embeds `inner`; the
    /// request focuses `outer:inner` with a POST body. The body must
    /// reach exactly the focused widget, and the rendered responses are
    /// spliced in place.
    #[tokio::test]
    async fn focused_widget_receives_method_and_body() {
        let loader = Arc::new(RecordingLoader {
            seen: Mutex::new(Vec::new()),
        });
        let translation = crate::translation::TranslationCache::new(
            crate::translation::TranslationStock::new("/nonexistent".into(), 1),
            16,
        );
        let now = std::time::Instant::now();
        translation.store(
            &TranslateRequest {
                widget_type: Some("outer-class".into()),
                ..Default::default()
            },
            widget_class("/outer-widget/", true, true),
            now,
        );
        translation.store(
            &TranslateRequest {
                widget_type: Some("inner-class".into()),
                ..Default::default()
            },
            widget_class("/inner-widget/", false, false),
            now,
        );

        let body = vec![b'x'; 42];
        let env = Arc::new(ProcessorEnv {
            loader: loader.clone(),
            translation,
            template_uri: "/outer.html".into(),
            request_headers: HeaderMap::new(),
            request_method: Method::POST,
            request_body: Arc::new(Mutex::new(Some(from_bytes(body)))),
            focus: Some("outer:inner".into()),
            focus_path_info: Some("/save".into()),
            focus_query: None,
            focus_view: None,
            session: None,
            realm: "test".into(),
        });

        let template = r#"<body><c:widget type="outer-class" id="outer"/></body>"#;
        let out = process(
            from_bytes(template.to_string()),
            Widget::new_root(),
            env,
            PROCESSOR_CONTAINER | PROCESSOR_FOCUS_WIDGET | PROCESSOR_REWRITE_URL,
        );
        let rendered = crate::istream::collect(out).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&rendered),
            "<body>[outer INNER]</body>"
        );

        let seen = loader.seen.lock().unwrap();
        assert_eq!(seen.len(), 2, "outer and inner were each fetched once");

        let (outer_path, outer_method, outer_body) = &seen[0];
        assert!(outer_path.starts_with("/outer-widget"));
        assert_eq!(*outer_method, Method::GET, "outer is not focused");
        assert_eq!(*outer_body, 0, "outer gets no body");

        let (inner_path, inner_method, inner_body) = &seen[1];
        assert!(
            inner_path.starts_with("/inner-widget"),
            "inner path was {}",
            inner_path
        );
        assert!(inner_path.contains("/save"), "path_info appended: {}", inner_path);
        assert_eq!(*inner_method, Method::POST, "inner inherits the method");
        assert_eq!(*inner_body, 42, "inner receives the request body");
    }
}
