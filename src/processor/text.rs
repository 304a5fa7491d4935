use super::escape::html_unescape;
use crate::istream::{BoxIstream, Istream, IstreamError};
use bytes::Bytes;
use std::task::{Context, Poll};

/// Longest entity reference we care to reassemble across chunk
/// boundaries.
const MAX_ENTITY: usize = 12;

/// Text processor: expands character entities in a text response while
/// it streams through. Used for responses whose content type is one of
/// the designated text types.
pub struct TextIstream {
    input: Option<BoxIstream>,
    /// tail of the previous chunk that may be a split entity
    carry: Vec<u8>,
}

impl TextIstream {
    pub fn new(input: BoxIstream) -> Self {
        Self {
            input: Some(input),
            carry: Vec::new(),
        }
    }
}

/// A content type the text processor applies to.
pub fn is_text_type(content_type: &str) -> bool {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    matches!(base, "text/plain" | "text/csv" | "text/calendar")
}

impl Istream for TextIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        // entity expansion shrinks the data; only a lower bound exists
        if partial {
            Some(self.carry.len() as u64)
        } else {
            None
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            let Some(input) = self.input.as_mut() else {
                if self.carry.is_empty() {
                    return Poll::Ready(None);
                }
                let rest = std::mem::take(&mut self.carry);
                let text = String::from_utf8_lossy(&rest).into_owned();
                return Poll::Ready(Some(Ok(Bytes::from(text))));
            };
            match input.poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let mut data = std::mem::take(&mut self.carry);
                    data.extend_from_slice(&chunk);

                    // hold back a trailing '&…' that may continue in the
                    // next chunk
                    let keep = match data.iter().rposition(|&b| b == b'&') {
                        Some(amp)
                            if data.len() - amp <= MAX_ENTITY
                                && !data[amp..].contains(&b';') =>
                        {
                            amp
                        }
                        _ => data.len(),
                    };
                    self.carry = data.split_off(keep);
                    if data.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&data);
                    return Poll::Ready(Some(Ok(Bytes::from(html_unescape(&text)))));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.input = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.input = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes, CatIstream};

    #[tokio::test]
    async fn expands_entities() {
        let s = TextIstream::new(from_bytes("a &amp; b &lt;ok&gt;"));
        assert_eq!(
            collect(Box::new(s)).await.unwrap(),
            Bytes::from("a & b <ok>")
        );
    }

    #[tokio::test]
    async fn entity_split_across_chunks() {
        let input = CatIstream::new([from_bytes("x &am"), from_bytes("p; y")]);
        let s = TextIstream::new(Box::new(input));
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("x & y"));
    }

    #[tokio::test]
    async fn trailing_ampersand_is_flushed() {
        let s = TextIstream::new(from_bytes("dangling &"));
        assert_eq!(
            collect(Box::new(s)).await.unwrap(),
            Bytes::from("dangling &")
        );
    }

    #[test]
    fn text_types() {
        assert!(is_text_type("text/plain; charset=utf-8"));
        assert!(!is_text_type("text/html"));
    }
}
