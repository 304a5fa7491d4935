pub mod request;
pub mod resolver;
pub mod rewrite;

use crate::istream::BoxIstream;
use crate::translation::TranslateResponse;
use http::Method;
use std::sync::Arc;

/// How an embedded widget is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WidgetDisplay {
    #[default]
    Inline,
    /// registered but not rendered
    None,
}

/// Which session slice a widget's state lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WidgetSessionScope {
    /// keyed by the widget's id path
    #[default]
    Resource,
    /// shared by all widgets of this site
    Site,
}

/// Request state distributed to the focused widget: exactly one widget
/// in a response tree receives the inbound body and query string.
pub struct FromRequest {
    pub method: Method,
    pub body: Option<BoxIstream>,
    pub query_string: Option<String>,
    pub path_info: Option<String>,
    pub view: Option<String>,
}

/// A nested, separately fetched fragment embedded into a template
/// response. Widgets form a tree; links to the parent are plain data
/// (the id path), never owning references.
pub struct Widget {
    pub class_name: Option<String>,
    /// resolved lazily via the translation server
    pub class: Option<Arc<TranslateResponse>>,
    /// unique among siblings
    pub id: Option<String>,
    /// ids from the root joined with ':'
    pub id_path: Option<String>,
    pub display: WidgetDisplay,
    pub session_scope: WidgetSessionScope,
    /// query string assembled from `c:param` elements
    pub query_string: Option<String>,
    /// extra request headers from `c:header` elements
    pub headers: Vec<(String, String)>,
    /// `c:path-info` element value
    pub path_info: Option<String>,
    pub view_name: Option<String>,
    pub from_request: Option<FromRequest>,
}

impl Widget {
    pub fn new_root() -> Self {
        Self {
            class_name: None,
            class: None,
            id: None,
            id_path: Some(String::new()),
            display: WidgetDisplay::Inline,
            session_scope: WidgetSessionScope::Resource,
            query_string: None,
            headers: Vec::new(),
            path_info: None,
            view_name: None,
            from_request: None,
        }
    }

    /// Create a child under `parent`. The id path is derived from the
    /// parent's; a child without an id cannot be addressed (no path).
    pub fn new_child(parent_id_path: Option<&str>, id: Option<String>) -> Self {
        let id_path = match (&id, parent_id_path) {
            (Some(id), Some(parent)) if parent.is_empty() => Some(id.clone()),
            (Some(id), Some(parent)) => Some(format!("{}:{}", parent, id)),
            _ => None,
        };
        Self {
            class_name: None,
            class: None,
            id,
            id_path,
            display: WidgetDisplay::Inline,
            session_scope: WidgetSessionScope::Resource,
            query_string: None,
            headers: Vec::new(),
            path_info: None,
            view_name: None,
            from_request: None,
        }
    }

    pub fn is_focused(&self) -> bool {
        self.from_request.is_some()
    }

    /// Identifier prefix for CSS class / DOM id rewriting; prepended to
    /// `___`-prefixed names.
    pub fn prefix(&self) -> Option<String> {
        self.id_path
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| p.replace(':', "_"))
    }

    /// The widget class name in a form usable inside a CSS class.
    pub fn quoted_class_name(&self) -> Option<&str> {
        self.class_name
            .as_deref()
            .filter(|n| n.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'))
    }

    /// Append a `c:param` pair to the widget's query string,
    /// URL-encoding both sides.
    pub fn add_param(&mut self, name: &str, value: &str) {
        use crate::processor::escape::uri_escape;
        let pair = format!("{}={}", uri_escape(name), uri_escape(value));
        match &mut self.query_string {
            Some(qs) => {
                qs.push('&');
                qs.push_str(&pair);
            }
            None => self.query_string = Some(pair),
        }
    }

    /// Validate and record a `c:header`: the name must start with `X-`
    /// and contain only alphanumerics and dashes.
    pub fn add_header(&mut self, name: &str, value: &str) -> bool {
        let valid = name.len() > 2
            && (name.starts_with("X-") || name.starts_with("x-"))
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !valid {
            return false;
        }
        self.headers.push((name.to_string(), value.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_paths_nest() {
        let root = Widget::new_root();
        let outer = Widget::new_child(root.id_path.as_deref(), Some("outer".into()));
        assert_eq!(outer.id_path.as_deref(), Some("outer"));
        let inner = Widget::new_child(outer.id_path.as_deref(), Some("inner".into()));
        assert_eq!(inner.id_path.as_deref(), Some("outer:inner"));
        assert_eq!(inner.prefix().as_deref(), Some("outer_inner"));
    }

    #[test]
    fn anonymous_widget_has_no_path() {
        let root = Widget::new_root();
        let w = Widget::new_child(root.id_path.as_deref(), None);
        assert!(w.id_path.is_none());
        assert!(w.prefix().is_none());
    }

    #[test]
    fn params_build_query_string() {
        let mut w = Widget::new_root();
        w.add_param("a", "1");
        w.add_param("b", "x y");
        assert_eq!(w.query_string.as_deref(), Some("a=1&b=x%20y"));
    }

    #[test]
    fn header_validation() {
        let mut w = Widget::new_root();
        assert!(w.add_header("X-Custom-1", "v"));
        assert!(!w.add_header("Cookie", "v"));
        assert!(!w.add_header("X-Bad_Header", "v"));
        assert!(!w.add_header("X-", "v"));
        assert_eq!(w.headers.len(), 1);
    }
}
