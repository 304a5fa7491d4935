use super::{BoxIstream, Istream, IstreamError};
use bytes::{Buf, Bytes};
use std::task::{Context, Poll};

/// Sans-io parser for RFC 7230 chunked transfer framing.
///
/// `feed()` consumes framing bytes and reports how much of the input
/// belongs to the current chunk's payload; the caller decides what to do
/// with payload bytes (forward, buffer, splice). The parser never copies
/// payload data.
#[derive(Debug)]
pub struct DechunkParser {
    state: State,
    chunk_remaining: u64,
    size_digits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    End,
}

/// One step of parser progress.
#[derive(Debug, PartialEq, Eq)]
pub enum DechunkEvent {
    /// `len` payload bytes follow at the start of the unconsumed input.
    Data { len: usize },
    /// More framing input is needed.
    NeedMore,
    /// The terminating zero chunk (and its trailer) has been consumed;
    /// any remaining input belongs to the next message.
    End,
}

impl Default for DechunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DechunkParser {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            chunk_remaining: 0,
            size_digits: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.state == State::End
    }

    /// Parse framing at the start of `input`. Returns the event and the
    /// number of framing bytes consumed. Payload bytes indicated by
    /// `Data { len }` are *not* consumed by the parser; the caller must
    /// account for them via `consume_data()`.
    pub fn feed(&mut self, input: &[u8]) -> Result<(DechunkEvent, usize), IstreamError> {
        let mut pos = 0;
        while pos < input.len() {
            let b = input[pos];
            match self.state {
                State::Size => match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (b as char).to_digit(16).unwrap() as u64;
                        self.chunk_remaining = self
                            .chunk_remaining
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit))
                            .ok_or(IstreamError::Chunked("chunk size overflow"))?;
                        self.size_digits += 1;
                        pos += 1;
                    }
                    b';' => {
                        if self.size_digits == 0 {
                            return Err(IstreamError::Chunked("missing chunk size"));
                        }
                        self.state = State::SizeExt;
                        pos += 1;
                    }
                    b'\r' => {
                        if self.size_digits == 0 {
                            return Err(IstreamError::Chunked("missing chunk size"));
                        }
                        self.state = State::SizeLf;
                        pos += 1;
                    }
                    _ => return Err(IstreamError::Chunked("invalid chunk size")),
                },
                State::SizeExt => {
                    // chunk extensions are ignored
                    if b == b'\r' {
                        self.state = State::SizeLf;
                    }
                    pos += 1;
                }
                State::SizeLf => {
                    if b != b'\n' {
                        return Err(IstreamError::Chunked("missing LF after chunk size"));
                    }
                    pos += 1;
                    self.size_digits = 0;
                    if self.chunk_remaining == 0 {
                        self.state = State::TrailerStart;
                    } else {
                        self.state = State::Data;
                        return Ok((
                            DechunkEvent::Data {
                                len: (input.len() - pos).min(self.chunk_remaining as usize),
                            },
                            pos,
                        ));
                    }
                }
                State::Data => {
                    return Ok((
                        DechunkEvent::Data {
                            len: (input.len() - pos).min(self.chunk_remaining as usize),
                        },
                        pos,
                    ));
                }
                State::DataCr => {
                    if b != b'\r' {
                        return Err(IstreamError::Chunked("missing CR after chunk data"));
                    }
                    self.state = State::DataLf;
                    pos += 1;
                }
                State::DataLf => {
                    if b != b'\n' {
                        return Err(IstreamError::Chunked("missing LF after chunk data"));
                    }
                    self.state = State::Size;
                    pos += 1;
                }
                State::TrailerStart => {
                    if b == b'\r' {
                        self.state = State::TrailerLf;
                    } else {
                        self.state = State::Trailer;
                    }
                    pos += 1;
                }
                State::Trailer => {
                    // trailer headers are discarded
                    if b == b'\n' {
                        self.state = State::TrailerStart;
                    }
                    pos += 1;
                }
                State::TrailerLf => {
                    if b != b'\n' {
                        return Err(IstreamError::Chunked("missing LF after trailer"));
                    }
                    self.state = State::End;
                    pos += 1;
                    return Ok((DechunkEvent::End, pos));
                }
                State::End => return Ok((DechunkEvent::End, pos)),
            }
        }
        Ok((DechunkEvent::NeedMore, pos))
    }

    /// Account for `n` payload bytes the caller consumed after a
    /// `Data { len }` event.
    pub fn consume_data(&mut self, n: usize) {
        debug_assert!(self.state == State::Data);
        debug_assert!(n as u64 <= self.chunk_remaining);
        self.chunk_remaining -= n as u64;
        if self.chunk_remaining == 0 {
            self.state = State::DataCr;
        }
    }
}

/// Decodes a chunked stream, delivering the payload bytes and raising end
/// of stream on the terminating zero chunk. The `on_end` hook fires once
/// when the terminator has been seen, so the owner of the underlying
/// socket can start the next message.
pub struct DechunkIstream {
    input: Option<BoxIstream>,
    parser: DechunkParser,
    /// undecoded input carried over between polls
    pending: Bytes,
    on_end: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl DechunkIstream {
    pub fn new(input: BoxIstream) -> Self {
        Self {
            input: Some(input),
            parser: DechunkParser::new(),
            pending: Bytes::new(),
            on_end: None,
        }
    }

    pub fn with_end_hook(input: BoxIstream, on_end: impl FnOnce() + Send + Sync + 'static) -> Self {
        let mut s = Self::new(input);
        s.on_end = Some(Box::new(on_end));
        s
    }

    fn finish(&mut self) {
        self.input = None;
        if let Some(hook) = self.on_end.take() {
            hook();
        }
    }
}

impl Istream for DechunkIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        if partial && self.parser.state == State::Data {
            Some(
                self.pending
                    .len()
                    .min(self.parser.chunk_remaining as usize) as u64,
            )
        } else if partial {
            Some(0)
        } else {
            None
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            if !self.pending.is_empty() {
                match self.parser.feed(&self.pending) {
                    Ok((DechunkEvent::Data { len }, consumed)) => {
                        self.pending.advance(consumed);
                        if len > 0 {
                            let payload = self.pending.split_to(len);
                            self.parser.consume_data(len);
                            return Poll::Ready(Some(Ok(payload)));
                        }
                    }
                    Ok((DechunkEvent::End, consumed)) => {
                        self.pending.advance(consumed);
                        self.finish();
                        return Poll::Ready(None);
                    }
                    Ok((DechunkEvent::NeedMore, consumed)) => {
                        self.pending.advance(consumed);
                    }
                    Err(e) => {
                        self.input = None;
                        return Poll::Ready(Some(Err(e)));
                    }
                }
            }

            let Some(input) = self.input.as_mut() else {
                return Poll::Ready(None);
            };
            match input.poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    debug_assert!(self.pending.is_empty());
                    self.pending = chunk;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.input = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.input = None;
                    return Poll::Ready(Some(Err(IstreamError::Chunked(
                        "stream ended before terminating chunk",
                    ))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn decodes_two_chunks() {
        let s = DechunkIstream::new(from_bytes("3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n"));
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("foobar"));
    }

    #[tokio::test]
    async fn end_hook_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let s = DechunkIstream::with_end_hook(from_bytes("0\r\n\r\n"), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::new());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let s = DechunkIstream::new(from_bytes("5\r\nhel"));
        assert!(collect(Box::new(s)).await.is_err());
    }

    #[tokio::test]
    async fn rejects_garbage_size() {
        let s = DechunkIstream::new(from_bytes("zz\r\n"));
        assert!(collect(Box::new(s)).await.is_err());
    }

    #[test]
    fn parser_reports_leftover_for_pipelining() {
        let mut p = DechunkParser::new();
        let input = b"3\r\nabc\r\n0\r\n\r\nGET /next";
        let (ev, consumed) = p.feed(input).unwrap();
        assert_eq!(ev, DechunkEvent::Data { len: 3 });
        let rest = &input[consumed..];
        assert_eq!(&rest[..3], b"abc");
        p.consume_data(3);
        let (ev, consumed) = p.feed(&rest[3..]).unwrap();
        assert_eq!(ev, DechunkEvent::End);
        assert_eq!(&rest[3 + consumed..], b"GET /next");
        assert!(p.is_end());
    }

    #[tokio::test]
    async fn chunk_extensions_are_ignored() {
        let s = DechunkIstream::new(from_bytes("3;ext=1\r\nfoo\r\n0\r\n\r\n"));
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("foo"));
    }
}
