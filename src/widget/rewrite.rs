use super::Widget;
use crate::processor::escape::uri_escape;
use crate::resource::ResourceAddress;

/// How a rewritten link addresses the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewriteMode {
    /// straight to the widget server, bypassing the template
    Direct,
    /// through the template URI, focusing this widget
    #[default]
    Focus,
    /// like focus, but requesting only this widget's fragment
    Partial,
}

impl RewriteMode {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "direct" => RewriteMode::Direct,
            "focus" => RewriteMode::Focus,
            "partial" => RewriteMode::Partial,
            _ => return None,
        })
    }
}

fn is_untouchable(value: &str) -> bool {
    // absolute URIs, mailto and pure fragments stay as they are
    value.starts_with('#')
        || value.starts_with("mailto:")
        || value.contains("://")
        || value.starts_with("javascript:")
        || value.starts_with("data:")
}

/// Rewrite a link found inside a widget's markup. Returns `None` when
/// the value must be left alone.
pub fn rewrite_widget_uri(
    widget: &Widget,
    template_uri: &str,
    mode: RewriteMode,
    value: &str,
    view: Option<&str>,
) -> Option<String> {
    if is_untouchable(value) {
        return None;
    }
    let id_path = widget.id_path.as_deref().filter(|p| !p.is_empty())?;

    // the fragment travels along verbatim
    let (value, fragment) = match value.find('#') {
        Some(i) => (&value[..i], &value[i..]),
        None => (value, ""),
    };

    match mode {
        RewriteMode::Direct => {
            let base = direct_base(widget)?;
            let mut out = join_uri(&base, value);
            out.push_str(fragment);
            Some(out)
        }
        RewriteMode::Focus | RewriteMode::Partial => {
            let (path, query) = match value.find('?') {
                Some(i) => (&value[..i], Some(&value[i + 1..])),
                None => (value, None),
            };
            let template_path = template_uri.split('?').next().unwrap_or(template_uri);
            let mut out = String::with_capacity(template_path.len() + value.len() + 32);
            out.push_str(template_path);
            out.push_str("?focus=");
            out.push_str(&uri_escape(id_path));
            if !path.is_empty() {
                out.push_str("&path=");
                out.push_str(&uri_escape(path));
            }
            if let Some(query) = query {
                out.push_str("&query=");
                out.push_str(&uri_escape(query));
            }
            if mode == RewriteMode::Partial {
                out.push_str("&frame=");
                out.push_str(&uri_escape(id_path));
            }
            if let Some(view) = view {
                out.push_str("&view=");
                out.push_str(&uri_escape(view));
            }
            out.push_str(fragment);
            Some(out)
        }
    }
}

/// The widget's own absolute URI base, from its resolved class.
fn direct_base(widget: &Widget) -> Option<String> {
    let class = widget.class.as_ref()?;
    let view = class.view(widget.view_name.as_deref())?;
    match &view.address {
        ResourceAddress::Http(a) => Some(format!(
            "{}://{}{}",
            if a.https { "https" } else { "http" },
            a.host_and_port,
            a.path
        )),
        ResourceAddress::Lhttp(a) => Some(a.uri.clone()),
        _ => None,
    }
}

/// Resolve `value` against `base` the way a browser would, minus the
/// corner cases templates do not produce.
fn join_uri(base: &str, value: &str) -> String {
    if value.is_empty() {
        return base.to_string();
    }
    if let Some(rest) = value.strip_prefix('/') {
        // absolute path: replace everything after the authority
        if let Some(scheme_end) = base.find("://") {
            if let Some(path_start) = base[scheme_end + 3..].find('/') {
                return format!("{}/{}", &base[..scheme_end + 3 + path_start], rest);
            }
            return format!("{}/{}", base, rest);
        }
        return value.to_string();
    }
    // relative: resolve against the base's directory
    match base.rfind('/') {
        Some(i) if base.find("://").map_or(true, |s| i > s + 2) => {
            format!("{}{}", &base[..=i], value)
        }
        _ => format!("{}/{}", base, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::HttpAddress;
    use crate::translation::{TranslateResponse, View};
    use std::sync::Arc;

    fn widget_with_class() -> Widget {
        let mut w = Widget::new_child(Some(""), Some("shop".into()));
        w.class = Some(Arc::new(TranslateResponse {
            views: vec![View {
                name: None,
                address: crate::resource::ResourceAddress::Http(HttpAddress {
                    https: false,
                    host_and_port: "widgets.internal:8080".into(),
                    path: "/shop/".into(),
                    addresses: vec![],
                }),
                ..Default::default()
            }],
            ..Default::default()
        }));
        w
    }

    #[test]
    fn absolute_and_mailto_untouched() {
        let w = widget_with_class();
        for value in [
            "https://other.example/x",
            "mailto:a@b.c",
            "#anchor",
            "javascript:void(0)",
        ] {
            assert_eq!(
                rewrite_widget_uri(&w, "/page.html", RewriteMode::Focus, value, None),
                None
            );
        }
    }

    #[test]
    fn focus_mode_builds_template_link() {
        let w = widget_with_class();
        let out =
            rewrite_widget_uri(&w, "/page.html?x=1", RewriteMode::Focus, "/save?id=3", None)
                .unwrap();
        assert_eq!(out, "/page.html?focus=shop&path=%2Fsave&query=id%3D3");
    }

    #[test]
    fn partial_mode_adds_frame() {
        let w = widget_with_class();
        let out = rewrite_widget_uri(&w, "/page.html", RewriteMode::Partial, "/list", None).unwrap();
        assert!(out.contains("&frame=shop"));
    }

    #[test]
    fn fragment_is_preserved() {
        let w = widget_with_class();
        let out =
            rewrite_widget_uri(&w, "/page.html", RewriteMode::Focus, "/a#sec-2", None).unwrap();
        assert!(out.ends_with("#sec-2"), "{}", out);
    }

    #[test]
    fn direct_mode_targets_widget_server() {
        let w = widget_with_class();
        let out = rewrite_widget_uri(&w, "/page.html", RewriteMode::Direct, "item/7", None).unwrap();
        assert_eq!(out, "http://widgets.internal:8080/shop/item/7");

        let out = rewrite_widget_uri(&w, "/page.html", RewriteMode::Direct, "/abs", None).unwrap();
        assert_eq!(out, "http://widgets.internal:8080/abs");
    }

    #[test]
    fn view_parameter_is_carried() {
        let w = widget_with_class();
        let out =
            rewrite_widget_uri(&w, "/p", RewriteMode::Focus, "/x", Some("compact")).unwrap();
        assert!(out.contains("&view=compact"));
    }
}
