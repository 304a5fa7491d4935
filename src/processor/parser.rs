/// Streaming XML/HTML tokenizer. Bytes flow through unchanged; the
/// parser only reports where tags, attributes and character data sit in
/// the stream (as absolute byte offsets) so a consumer can splice
/// replacements over those ranges.
///
/// This is not an HTML5 tokenizer: it understands tags, quoted
/// attributes, comments, doctypes and the raw-text elements `script`
/// and `style`, which is exactly what template processing needs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// `<name …>`
    Open,
    /// `</name>`
    Close,
    /// `<name …/>`
    Short,
}

#[derive(Debug)]
pub struct XmlTag {
    pub name: String,
    pub kind: TagKind,
    /// offset of the `<`
    pub start: u64,
    /// offset just past the `>`; only valid in `on_tag_finished`
    pub end: u64,
}

#[derive(Debug)]
pub struct XmlAttr {
    /// lowercased
    pub name: String,
    /// entity-unescaped value
    pub value: String,
    /// offset of the first name byte
    pub name_start: u64,
    /// offsets of the raw value, excluding quotes
    pub value_start: u64,
    pub value_end: u64,
    /// the value was enclosed in quotes
    pub quoted: bool,
}

impl XmlAttr {
    /// The whole `name="value"` span, for deleting an attribute.
    pub fn full_range(&self) -> (u64, u64) {
        (
            self.name_start,
            self.value_end + if self.quoted { 1 } else { 0 },
        )
    }
}

pub trait XmlParserHandler {
    /// A tag has been recognised. Returning `false` skips the
    /// per-attribute callbacks of this tag.
    fn on_tag_start(&mut self, tag: &XmlTag) -> bool;

    fn on_attribute(&mut self, attr: &XmlAttr);

    /// The tag's `>` has been consumed; `tag.end` is now valid.
    fn on_tag_finished(&mut self, tag: &XmlTag);

    /// A run of character data (also raw text inside script/style).
    fn on_cdata(&mut self, text: &[u8], start: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    /// got `<`, deciding what this is
    TagOpen,
    /// got `<!`, deciding between comment and declaration
    MarkupDecl { dashes: u8 },
    /// inside `<!-- … -->`; `trail` counts trailing dashes
    Comment { trail: u8 },
    /// `<!DOCTYPE …>` / `<?…?>`: skip to `>`
    Declaration,
    TagName,
    /// between attributes
    InTag,
    AttrName,
    /// after the attribute name, before `=` or next attr
    AfterAttrName,
    /// after `=`
    BeforeAttrValue,
    AttrValue { quote: u8 },
    AttrValueUnquoted,
    /// inside script/style, looking for `</name`
    RawText,
    /// matching the closing name inside raw text
    RawTextClose,
}

pub struct XmlParser {
    state: State,
    position: u64,

    tag_start: u64,
    tag_name: String,
    tag_kind: TagKind,
    tag_interesting: bool,

    attr_name: String,
    attr_name_start: u64,
    attr_value: Vec<u8>,
    attr_value_start: u64,
    attr_quoted: bool,

    /// name of the raw-text element we are inside
    raw_element: String,
    /// partial `</name` match while in raw text
    raw_match: String,
    raw_match_start: u64,
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlParser {
    pub fn new() -> Self {
        Self {
            state: State::Text,
            position: 0,
            tag_start: 0,
            tag_name: String::new(),
            tag_kind: TagKind::Open,
            tag_interesting: false,
            attr_name: String::new(),
            attr_name_start: 0,
            attr_value: Vec::new(),
            attr_value_start: 0,
            attr_quoted: false,
            raw_element: String::new(),
            raw_match: String::new(),
            raw_match_start: 0,
        }
    }

    /// Total bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The stream offset up to which the input is plain, settled
    /// character data: everything before a construct that is still being
    /// parsed.
    pub fn settled_position(&self) -> u64 {
        match self.state {
            State::Text | State::RawText => self.position,
            State::RawTextClose => self.raw_match_start,
            _ => self.tag_start,
        }
    }

    pub fn feed(&mut self, input: &[u8], handler: &mut dyn XmlParserHandler) {
        let base = self.position;
        let mut cdata_start: Option<usize> = None;
        let mut i = 0;

        macro_rules! flush_cdata {
            () => {
                if let Some(s) = cdata_start.take() {
                    if s < i {
                        handler.on_cdata(&input[s..i], base + s as u64);
                    }
                }
            };
        }

        while i < input.len() {
            let b = input[i];
            match self.state {
                State::Text => {
                    if b == b'<' {
                        flush_cdata!();
                        self.tag_start = base + i as u64;
                        self.state = State::TagOpen;
                    } else if cdata_start.is_none() {
                        cdata_start = Some(i);
                    }
                    i += 1;
                }
                State::TagOpen => {
                    match b {
                        b'/' => {
                            self.tag_kind = TagKind::Close;
                            self.tag_name.clear();
                            self.state = State::TagName;
                            i += 1;
                        }
                        b'!' => {
                            self.state = State::MarkupDecl { dashes: 0 };
                            i += 1;
                        }
                        b'?' => {
                            self.state = State::Declaration;
                            i += 1;
                        }
                        b if b.is_ascii_alphabetic() => {
                            self.tag_kind = TagKind::Open;
                            self.tag_name.clear();
                            self.state = State::TagName;
                        }
                        _ => {
                            // stray '<': hand it back as character data
                            handler.on_cdata(b"<", self.tag_start);
                            self.state = State::Text;
                        }
                    }
                }
                State::MarkupDecl { dashes } => match (b, dashes) {
                    (b'-', 0) => {
                        self.state = State::MarkupDecl { dashes: 1 };
                        i += 1;
                    }
                    (b'-', 1) => {
                        self.state = State::Comment { trail: 0 };
                        i += 1;
                    }
                    _ => {
                        self.state = State::Declaration;
                    }
                },
                State::Comment { trail } => {
                    match b {
                        b'-' => {
                            self.state = State::Comment {
                                trail: (trail + 1).min(2),
                            };
                        }
                        b'>' if trail >= 2 => {
                            self.state = State::Text;
                        }
                        _ => {
                            self.state = State::Comment { trail: 0 };
                        }
                    }
                    i += 1;
                }
                State::Declaration => {
                    if b == b'>' {
                        self.state = State::Text;
                    }
                    i += 1;
                }
                State::TagName => match b {
                    b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b':' | b'-' | b'_' | b'.' => {
                        self.tag_name.push(b.to_ascii_lowercase() as char);
                        i += 1;
                    }
                    _ => {
                        self.start_tag(handler);
                        self.state = State::InTag;
                    }
                },
                State::InTag => match b {
                    b'>' => {
                        i += 1;
                        self.finish_tag(handler, base + i as u64);
                    }
                    b'/' => {
                        self.tag_kind = TagKind::Short;
                        i += 1;
                    }
                    b if b.is_ascii_whitespace() => i += 1,
                    _ => {
                        self.attr_name.clear();
                        self.attr_name_start = base + i as u64;
                        self.state = State::AttrName;
                    }
                },
                State::AttrName => match b {
                    b'=' | b'>' | b'/' => {
                        self.state = State::AfterAttrName;
                    }
                    b if b.is_ascii_whitespace() => {
                        self.state = State::AfterAttrName;
                        i += 1;
                    }
                    _ => {
                        self.attr_name.push(b.to_ascii_lowercase() as char);
                        i += 1;
                    }
                },
                State::AfterAttrName => match b {
                    b'=' => {
                        self.state = State::BeforeAttrValue;
                        i += 1;
                    }
                    b if b.is_ascii_whitespace() => i += 1,
                    _ => {
                        // attribute without a value
                        self.emit_attr_empty(handler, base + i as u64);
                        self.state = State::InTag;
                    }
                },
                State::BeforeAttrValue => match b {
                    b'"' | b'\'' => {
                        self.attr_value.clear();
                        self.attr_value_start = base + i as u64 + 1;
                        self.attr_quoted = true;
                        self.state = State::AttrValue { quote: b };
                        i += 1;
                    }
                    b if b.is_ascii_whitespace() => i += 1,
                    b'>' => {
                        self.emit_attr_empty(handler, base + i as u64);
                        self.state = State::InTag;
                    }
                    _ => {
                        self.attr_value.clear();
                        self.attr_value_start = base + i as u64;
                        self.attr_quoted = false;
                        self.state = State::AttrValueUnquoted;
                    }
                },
                State::AttrValue { quote } => {
                    if b == quote {
                        self.emit_attr(handler, base + i as u64);
                        self.state = State::InTag;
                        i += 1;
                    } else {
                        self.attr_value.push(b);
                        i += 1;
                    }
                }
                State::AttrValueUnquoted => match b {
                    b'>' | b'/' => {
                        self.emit_attr(handler, base + i as u64);
                        self.state = State::InTag;
                    }
                    b if b.is_ascii_whitespace() => {
                        self.emit_attr(handler, base + i as u64);
                        self.state = State::InTag;
                        i += 1;
                    }
                    _ => {
                        self.attr_value.push(b);
                        i += 1;
                    }
                },
                State::RawText => {
                    if b == b'<' {
                        flush_cdata!();
                        self.raw_match.clear();
                        self.raw_match_start = base + i as u64;
                        self.state = State::RawTextClose;
                    } else if cdata_start.is_none() {
                        cdata_start = Some(i);
                    }
                    i += 1;
                }
                State::RawTextClose => {
                    let expect: &[u8] = b"/";
                    let matched = self.raw_match.len();
                    let want = if matched == 0 {
                        expect[0]
                    } else if matched <= self.raw_element.len() {
                        self.raw_element.as_bytes()[matched - 1]
                    } else {
                        0
                    };
                    if matched <= self.raw_element.len() && b.to_ascii_lowercase() == want {
                        self.raw_match.push(b.to_ascii_lowercase() as char);
                        i += 1;
                    } else if matched > self.raw_element.len()
                        && (b == b'>' || b.is_ascii_whitespace())
                    {
                        // full "</name" matched: this is the real close tag
                        self.tag_start = self.raw_match_start;
                        self.tag_kind = TagKind::Close;
                        self.tag_name = self.raw_element.clone();
                        self.raw_element.clear();
                        self.start_tag(handler);
                        self.state = State::InTag;
                    } else {
                        // not the closing tag; re-emit as raw text
                        handler.on_cdata(
                            format!("<{}", self.raw_match).as_bytes(),
                            self.raw_match_start,
                        );
                        self.raw_match.clear();
                        self.state = State::RawText;
                    }
                }
            }
        }
        flush_cdata!();
        self.position = base + input.len() as u64;
    }

    fn start_tag(&mut self, handler: &mut dyn XmlParserHandler) {
        let tag = XmlTag {
            name: std::mem::take(&mut self.tag_name),
            kind: self.tag_kind,
            start: self.tag_start,
            end: 0,
        };
        self.tag_interesting = handler.on_tag_start(&tag);
        self.tag_name = tag.name;
    }

    fn finish_tag(&mut self, handler: &mut dyn XmlParserHandler, end: u64) {
        let tag = XmlTag {
            name: std::mem::take(&mut self.tag_name),
            kind: self.tag_kind,
            start: self.tag_start,
            end,
        };
        handler.on_tag_finished(&tag);

        if tag.kind == TagKind::Open && (tag.name == "script" || tag.name == "style") {
            self.raw_element = tag.name;
            self.state = State::RawText;
        } else {
            self.state = State::Text;
        }
    }

    fn emit_attr(&mut self, handler: &mut dyn XmlParserHandler, value_end: u64) {
        if self.tag_interesting && !self.attr_name.is_empty() {
            let raw = String::from_utf8_lossy(&self.attr_value);
            let attr = XmlAttr {
                name: std::mem::take(&mut self.attr_name),
                value: super::escape::html_unescape(&raw),
                name_start: self.attr_name_start,
                value_start: self.attr_value_start,
                value_end,
                quoted: self.attr_quoted,
            };
            handler.on_attribute(&attr);
        } else {
            self.attr_name.clear();
        }
        self.attr_value.clear();
    }

    fn emit_attr_empty(&mut self, handler: &mut dyn XmlParserHandler, at: u64) {
        if self.tag_interesting && !self.attr_name.is_empty() {
            let attr = XmlAttr {
                name: std::mem::take(&mut self.attr_name),
                value: String::new(),
                name_start: self.attr_name_start,
                value_start: at,
                value_end: at,
                quoted: false,
            };
            handler.on_attribute(&attr);
        } else {
            self.attr_name.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl XmlParserHandler for Recorder {
        fn on_tag_start(&mut self, tag: &XmlTag) -> bool {
            self.events
                .push(format!("start:{}:{:?}@{}", tag.name, tag.kind, tag.start));
            true
        }

        fn on_attribute(&mut self, attr: &XmlAttr) {
            self.events.push(format!(
                "attr:{}={}@{}..{}",
                attr.name, attr.value, attr.value_start, attr.value_end
            ));
        }

        fn on_tag_finished(&mut self, tag: &XmlTag) {
            self.events
                .push(format!("finish:{}@{}..{}", tag.name, tag.start, tag.end));
        }

        fn on_cdata(&mut self, text: &[u8], start: u64) {
            self.events.push(format!(
                "cdata:{}@{}",
                String::from_utf8_lossy(text),
                start
            ));
        }
    }

    fn parse(input: &str) -> Vec<String> {
        let mut parser = XmlParser::new();
        let mut rec = Recorder::default();
        parser.feed(input.as_bytes(), &mut rec);
        rec.events
    }

    fn parse_split(input: &str, at: usize) -> Vec<String> {
        let mut parser = XmlParser::new();
        let mut rec = Recorder::default();
        parser.feed(&input.as_bytes()[..at], &mut rec);
        parser.feed(&input.as_bytes()[at..], &mut rec);
        rec.events
    }

    #[test]
    fn simple_tag_with_attrs() {
        let events = parse(r#"pre<a href="/x" class='c'>text</a>post"#);
        assert_eq!(
            events,
            vec![
                "cdata:pre@0",
                "start:a:Open@3",
                "attr:href=/x@12..14",
                "attr:class=c@23..24",
                "finish:a@3..26",
                "cdata:text@26",
                "start:a:Close@30",
                "finish:a@30..34",
                "cdata:post@34",
            ]
        );
    }

    #[test]
    fn offsets_survive_chunk_splits() {
        let input = r#"ab<img src="/pic.png"/>cd"#;
        let whole = parse(input);
        for at in 1..input.len() - 1 {
            // cdata events may split differently; compare non-cdata
            let split: Vec<String> = parse_split(input, at)
                .into_iter()
                .filter(|e| !e.starts_with("cdata"))
                .collect();
            let reference: Vec<String> = whole
                .iter()
                .filter(|e| !e.starts_with("cdata"))
                .cloned()
                .collect();
            assert_eq!(split, reference, "split at {}", at);
        }
    }

    #[test]
    fn short_tag_kind() {
        let events = parse("<br/>");
        assert!(events.iter().any(|e| e.contains("finish:br@0..5")));
        assert!(events[0].contains("Open") || events[0].contains("Short"));
    }

    #[test]
    fn comment_is_skipped() {
        let events = parse("a<!-- <b> -->c");
        assert_eq!(events, vec!["cdata:a@0", "cdata:c@13"]);
    }

    #[test]
    fn doctype_is_skipped() {
        let events = parse("<!DOCTYPE html><p>");
        assert!(events.iter().any(|e| e.starts_with("start:p")));
        assert!(!events.iter().any(|e| e.contains("doctype")));
    }

    #[test]
    fn script_raw_text_is_cdata() {
        let events = parse("<script>if (a < b) {}</script>x");
        assert!(events.iter().any(|e| e == "cdata:if (a @8"
            || e.contains("cdata:if (a < b) {}@8")
            || e.starts_with("cdata:if (a")));
        // the inner "<" must not open a tag
        assert!(!events.iter().any(|e| e.starts_with("start:b")));
        assert!(events.iter().any(|e| e.starts_with("start:script:Close")));
    }

    #[test]
    fn entities_in_attr_values_are_unescaped() {
        let events = parse(r#"<a href="/x?a=1&amp;b=2">"#);
        assert!(events.iter().any(|e| e.contains("attr:href=/x?a=1&b=2")));
    }

    #[test]
    fn unquoted_attr_value() {
        let events = parse("<a href=/plain>");
        assert!(events.iter().any(|e| e.contains("attr:href=/plain")));
    }

    #[test]
    fn settled_position_holds_at_open_tag() {
        let mut parser = XmlParser::new();
        let mut rec = Recorder::default();
        parser.feed(b"abc<a href=", &mut rec);
        assert_eq!(parser.settled_position(), 3);
        parser.feed(b"\"/x\">", &mut rec);
        assert_eq!(parser.settled_position(), 16);
    }
}
