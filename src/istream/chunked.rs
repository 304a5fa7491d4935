use super::{BoxIstream, Istream, IstreamError};
use bytes::{BufMut, Bytes, BytesMut};
use std::task::{Context, Poll};

/// Applies RFC 7230 chunked transfer encoding to the wrapped stream.
pub struct ChunkedIstream {
    input: Option<BoxIstream>,
    /// terminator pending after input EOF
    terminated: bool,
}

impl ChunkedIstream {
    pub fn new(input: BoxIstream) -> Self {
        Self {
            input: Some(input),
            terminated: false,
        }
    }

    fn frame(chunk: &[u8]) -> Bytes {
        debug_assert!(!chunk.is_empty());
        let mut out = BytesMut::with_capacity(chunk.len() + 16);
        let mut hex = [0u8; 16];
        let mut n = chunk.len();
        let mut i = hex.len();
        while n > 0 {
            i -= 1;
            hex[i] = b"0123456789abcdef"[n & 0xf];
            n >>= 4;
        }
        out.put_slice(&hex[i..]);
        out.put_slice(b"\r\n");
        out.put_slice(chunk);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

impl Istream for ChunkedIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        if partial {
            // the input length is a valid lower bound on the framed output
            match &self.input {
                Some(input) => input.available(true),
                None if !self.terminated => Some(5),
                None => Some(0),
            }
        } else {
            // the exact framed size depends on future chunk boundaries
            None
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            let Some(input) = self.input.as_mut() else {
                if self.terminated {
                    return Poll::Ready(None);
                }
                self.terminated = true;
                return Poll::Ready(Some(Ok(Bytes::from_static(b"0\r\n\r\n"))));
            };
            match input.poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Self::frame(&chunk))));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.input = None;
                    self.terminated = true;
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
    use crate::istream::{collect, from_bytes, DechunkIstream};

    #[tokio::test]
    async fn frames_and_terminates() {
        let s = ChunkedIstream::new(from_bytes("hello"));
        let out = collect(Box::new(s)).await.unwrap();
        assert_eq!(out, Bytes::from("5\r\nhello\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn empty_input_is_bare_terminator() {
        let s = ChunkedIstream::new(from_bytes(""));
        let out = collect(Box::new(s)).await.unwrap();
        assert_eq!(out, Bytes::from("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn encode_decode_round_trip() {
        let payload = "x".repeat(70000);
        let encoded = ChunkedIstream::new(from_bytes(payload.clone()));
        let decoded = DechunkIstream::new(Box::new(encoded));
        let out = collect(Box::new(decoded)).await.unwrap();
        assert_eq!(out, Bytes::from(payload));
    }
}
