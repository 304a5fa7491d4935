/// CSS-side widget isolation: `__name` identifiers get the widget class
/// name prepended, `___name` identifiers the widget instance prefix; a
/// single leading underscore marks a deliberately global name and stays
/// untouched. The same rules serve the `class` attribute scanner and
/// the `<style>` / text/css sub-processor, which additionally rewrites
/// `url(...)` references.

fn leading_underscores(token: &str) -> usize {
    token.bytes().take_while(|&b| b == b'_').count()
}

/// Apply the underscore rules to one identifier. `None` means the token
/// stays as it is.
pub fn prefix_token(token: &str, prefix: Option<&str>, class_name: Option<&str>) -> Option<String> {
    match leading_underscores(token) {
        0 | 1 => None,
        2 => class_name.map(|c| format!("{}{}", c, token)),
        _ => prefix.map(|p| format!("{}{}", p, token)),
    }
}

/// Scan a whitespace-separated `class` attribute value. Returns the
/// rewritten value, or `None` when nothing changed.
pub fn prefix_class_value(
    value: &str,
    prefix: Option<&str>,
    class_name: Option<&str>,
) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut changed = false;
    let mut rest = value;
    while !rest.is_empty() {
        let token_end = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        let token = &rest[..token_end];
        match prefix_token(token, prefix, class_name) {
            Some(rewritten) => {
                out.push_str(&rewritten);
                changed = true;
            }
            None => out.push_str(token),
        }
        rest = &rest[token_end..];
        let ws_end = rest
            .find(|c: char| !c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        out.push_str(&rest[..ws_end]);
        rest = &rest[ws_end..];
    }
    changed.then_some(out)
}

/// Rewrite a whole `id` / `for` / `name` attribute value.
pub fn prefix_identifier(
    value: &str,
    prefix: Option<&str>,
    class_name: Option<&str>,
) -> Option<String> {
    prefix_token(value, prefix, class_name)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Process a CSS block: prefix `.class` / `#id` selectors per the
/// underscore rules and rewrite `url(...)` references through the
/// widget URI rewriter.
pub fn process_css(
    source: &str,
    prefix: Option<&str>,
    class_name: Option<&str>,
    rewrite_uri: impl Fn(&str) -> Option<String>,
) -> String {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        // url( … )
        if b == b'u' && bytes[i..].starts_with(b"url(") {
            let value_start = i + 4;
            if let Some(close) = source[value_start..].find(')') {
                let raw = &source[value_start..value_start + close];
                let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'');
                out.push_str("url(");
                match rewrite_uri(trimmed) {
                    Some(rewritten) => {
                        out.push('"');
                        out.push_str(&rewritten);
                        out.push('"');
                    }
                    None => out.push_str(raw),
                }
                out.push(')');
                i = value_start + close + 1;
                continue;
            }
        }

        // .class / #id selector identifiers
        if (b == b'.' || b == b'#') && i + 1 < bytes.len() && is_ident_byte(bytes[i + 1]) {
            let ident_start = i + 1;
            let mut ident_end = ident_start;
            while ident_end < bytes.len() && is_ident_byte(bytes[ident_end]) {
                ident_end += 1;
            }
            let ident = &source[ident_start..ident_end];
            out.push(b as char);
            match prefix_token(ident, prefix, class_name) {
                Some(rewritten) => out.push_str(&rewritten),
                None => out.push_str(ident),
            }
            i = ident_end;
            continue;
        }

        out.push(b as char);
        i += 1;
    }
    out
}

/// Stream transformer for whole `text/css` responses: buffers the
/// sheet, then emits it with selector prefixing and `url()` rewriting
/// applied. Stylesheets are small; buffering is bounded.
pub struct CssIstream {
    input: Option<crate::istream::BoxIstream>,
    buf: Vec<u8>,
    prefix: Option<String>,
    class_name: Option<String>,
    output: Option<bytes::Bytes>,
}

const CSS_BUFFER_LIMIT: usize = 1024 * 1024;

impl CssIstream {
    pub fn new(
        input: crate::istream::BoxIstream,
        prefix: Option<String>,
        class_name: Option<String>,
    ) -> Self {
        Self {
            input: Some(input),
            buf: Vec::new(),
            prefix,
            class_name,
            output: None,
        }
    }
}

impl crate::istream::Istream for CssIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        match &self.output {
            Some(out) => Some(out.len() as u64),
            None if partial => Some(0),
            None => None,
        }
    }

    fn poll_data(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<bytes::Bytes, crate::istream::IstreamError>>> {
        use std::task::Poll;
        loop {
            if let Some(out) = self.output.take() {
                return Poll::Ready(if out.is_empty() { None } else { Some(Ok(out)) });
            }
            let Some(input) = self.input.as_mut() else {
                return Poll::Ready(None);
            };
            match input.poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if self.buf.len() + chunk.len() > CSS_BUFFER_LIMIT {
                        self.input = None;
                        return Poll::Ready(Some(Err(crate::istream::IstreamError::msg(
                            "stylesheet too large to process",
                        ))));
                    }
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.input = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.input = None;
                    let source = String::from_utf8_lossy(&std::mem::take(&mut self.buf))
                        .into_owned();
                    let processed = process_css(
                        &source,
                        self.prefix.as_deref(),
                        self.class_name.as_deref(),
                        |_| None,
                    );
                    self.output = Some(bytes::Bytes::from(processed));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscore_rules() {
        assert_eq!(prefix_token("plain", Some("w1"), Some("shop")), None);
        assert_eq!(prefix_token("_global", Some("w1"), Some("shop")), None);
        assert_eq!(
            prefix_token("__scoped", Some("w1"), Some("shop")).as_deref(),
            Some("shop__scoped")
        );
        assert_eq!(
            prefix_token("___instance", Some("w1"), Some("shop")).as_deref(),
            Some("w1___instance")
        );
        // missing context keeps the token
        assert_eq!(prefix_token("__scoped", None, None), None);
    }

    #[test]
    fn class_value_scanning_preserves_whitespace() {
        let out = prefix_class_value("__a  _b\t___c", Some("w"), Some("k")).unwrap();
        assert_eq!(out, "k__a  _b\tw___c");
        assert_eq!(prefix_class_value("a b", Some("w"), Some("k")), None);
    }

    #[test]
    fn css_selector_prefixing() {
        let out = process_css(
            ".__box { color: red; } #___main :hover {}",
            Some("w1"),
            Some("shop"),
            |_| None,
        );
        assert_eq!(out, ".shop__box { color: red; } #w1___main :hover {}");
    }

    #[test]
    fn css_url_rewriting() {
        let out = process_css(
            r#"body { background: url('/bg.png'); }"#,
            None,
            None,
            |uri| Some(format!("/rewritten{}", uri)),
        );
        assert_eq!(out, r#"body { background: url("/rewritten/bg.png"); }"#);
    }

    #[test]
    fn css_untouched_when_no_context() {
        let css = ".a { color: blue; }";
        assert_eq!(process_css(css, None, None, |_| None), css);
    }

    #[tokio::test]
    async fn css_stream_processes_whole_sheet() {
        let s = CssIstream::new(
            crate::istream::from_bytes(".__box { x: 1 } .plain {}"),
            Some("w".into()),
            Some("k".into()),
        );
        let out = crate::istream::collect(Box::new(s)).await.unwrap();
        assert_eq!(&out[..], b".k__box { x: 1 } .plain {}");
    }
}
