use super::{Istream, IstreamError};
use bytes::{Bytes, BytesMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

const READ_CHUNK: usize = 16 * 1024;

/// Adapts any `AsyncRead` (child stdout, pipe) into an `Istream`. EOF of
/// the reader is end of stream; the total length is unknown.
pub struct ReaderIstream<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send + Sync> ReaderIstream<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: AsyncRead + Unpin + Send + Sync> Istream for ReaderIstream<R> {
    fn available(&self, partial: bool) -> Option<u64> {
        if partial {
            Some(0)
        } else {
            None
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        let mut buf = BytesMut::zeroed(READ_CHUNK);
        let mut read_buf = ReadBuf::new(&mut buf);
        match Pin::new(&mut self.reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    Poll::Ready(None)
                } else {
                    buf.truncate(n);
                    Poll::Ready(Some(Ok(buf.freeze())))
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(IstreamError::Io(e)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::collect;

    #[tokio::test]
    async fn reads_until_eof() {
        let data: &[u8] = b"streamed bytes";
        let s = ReaderIstream::new(data);
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("streamed bytes"));
    }
}
