pub mod byte_channel;
pub mod cat;
pub mod catch;
pub mod chunked;
pub mod dechunk;
pub mod deferred;
pub mod fail;
pub mod file;
pub mod memory;
pub mod pipe;
pub mod reader;
pub mod replace;
pub mod tee;

use bytes::Bytes;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::task::{Context, Poll};

pub use byte_channel::{byte_channel, ByteSender, ChannelIstream};
pub use cat::CatIstream;
pub use catch::CatchIstream;
pub use chunked::ChunkedIstream;
pub use dechunk::{DechunkIstream, DechunkParser};
pub use deferred::{deferred, DeferredFill, DeferredIstream};
pub use fail::FailIstream;
pub use file::FileIstream;
pub use memory::MemoryIstream;
pub use pipe::PipeStock;
pub use reader::ReaderIstream;
pub use replace::{ReplaceControl, ReplaceIstream};
pub use tee::tee;

/// Classification of a file descriptor offered for zero-copy transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdType {
    File,
    Pipe,
    Socket,
    Tcp,
}

impl FdType {
    const fn bit(self) -> u8 {
        match self {
            FdType::File => 1,
            FdType::Pipe => 2,
            FdType::Socket => 4,
            FdType::Tcp => 8,
        }
    }
}

/// Bitmask of `FdType`s a consumer is willing to receive via the direct
/// transfer path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdTypeMask(u8);

impl FdTypeMask {
    pub const NONE: FdTypeMask = FdTypeMask(0);
    pub const ANY: FdTypeMask = FdTypeMask(0xf);

    pub fn of(types: &[FdType]) -> Self {
        let mut mask = 0;
        for t in types {
            mask |= t.bit();
        }
        FdTypeMask(mask)
    }

    pub fn contains(self, t: FdType) -> bool {
        self.0 & t.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IstreamError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed chunked encoding: {0}")]
    Chunked(&'static str),

    /// The peer closed the stream before the announced length was reached.
    #[error("premature end of stream ({remaining} bytes missing)")]
    Premature { remaining: u64 },

    /// The same failure delivered to more than one consumer (e.g. both
    /// sinks of a tee).
    #[error("{0}")]
    Shared(Arc<IstreamError>),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl IstreamError {
    pub fn other<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        IstreamError::Other(Box::new(e))
    }

    pub fn msg(msg: &'static str) -> Self {
        IstreamError::Other(msg.into())
    }
}

/// A read-ahead peek of upcoming stream data.
///
/// Buckets do not transfer ownership; after writing some of the peeked
/// bytes somewhere, the consumer reports the amount via
/// `Istream::consume_buckets()` and only then resumes normal reads.
#[derive(Default)]
pub struct BucketList {
    bufs: Vec<Bytes>,
    more: bool,
    non_buffer: bool,
}

impl BucketList {
    pub fn push(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.bufs.push(data);
        }
    }

    /// More data will follow beyond what is in the list.
    pub fn set_more(&mut self) {
        self.more = true;
    }

    /// Part of the stream cannot be represented as an in-memory slice.
    pub fn set_non_buffer(&mut self) {
        self.non_buffer = true;
        self.more = true;
    }

    pub fn has_more(&self) -> bool {
        self.more
    }

    pub fn has_non_buffer(&self) -> bool {
        self.non_buffer
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.bufs.iter().map(Bytes::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.bufs.iter()
    }
}

/// A file descriptor a stream is willing to hand to the consumer for a
/// kernel-side transfer (sendfile / splice).
#[derive(Debug, Clone, Copy)]
pub struct DirectSource {
    pub fd: RawFd,
    pub kind: FdType,
    /// Read offset for seekable fds; `None` for pipes and sockets.
    pub offset: Option<u64>,
    /// Upper bound on how much may be transferred, if known.
    pub remaining: Option<u64>,
}

/// An asynchronous, pull-driven producer of bytes.
///
/// The stream ends with exactly one of: `poll_data()` returning
/// `Ready(None)` (end of stream), `Ready(Some(Err(..)))` (failure), a
/// successful `into_fd()`, or the owner dropping it. After EOF or error it
/// must not be polled again.
///
/// `Poll::Pending` implies the stream has registered the caller's waker;
/// whoever reported "blocking" has already arranged its own wake-up.
pub trait Istream: Send + Sync {
    /// How much data is left?
    ///
    /// With `partial == false` the stream must report the exact number of
    /// bytes until the end, or `None` if it does not know; the partial
    /// variant is a lower-bound estimate. Within one read cycle the
    /// partial value never shrinks except by consumption.
    fn available(&self, partial: bool) -> Option<u64>;

    /// Advance without delivering data. Returns `None` if this stream
    /// cannot skip; skipping zero bytes probes for support.
    fn skip(&mut self, _n: u64) -> Option<u64> {
        None
    }

    /// Pull the next chunk.
    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>>;

    /// Append descriptors of upcoming data without consuming it. A stream
    /// that cannot peek marks the list `non_buffer`.
    fn fill_buckets(&mut self, list: &mut BucketList) -> Result<(), IstreamError> {
        list.set_non_buffer();
        Ok(())
    }

    /// Mark `n` bytes (as previously peeked) consumed. `n` may exceed this
    /// stream's own contribution when siblings provided the rest; the
    /// return value is how much this stream itself consumed.
    fn consume_buckets(&mut self, n: usize) -> usize {
        debug_assert_eq!(n, 0, "stream produced no buckets");
        0
    }

    /// Offer a file descriptor for zero-copy transfer, if this stream can.
    fn direct(&mut self) -> Option<DirectSource> {
        None
    }

    /// Mark `n` bytes consumed out of the fd returned by `direct()`.
    fn consume_direct(&mut self, _n: usize) {}

    /// Hand off the remaining data as a file descriptor, consuming the
    /// stream. Streams that cannot do this return themselves unchanged.
    fn into_fd(self: Box<Self>) -> Result<(FdType, std::os::unix::io::OwnedFd), BoxIstream>
    where
        Self: Sized + 'static,
    {
        Err(self)
    }
}

pub type BoxIstream = Box<dyn Istream>;

/// Read the entire stream into one contiguous buffer. Test / small-body
/// helper; bodies on the hot path are never collected like this.
pub async fn collect(mut stream: BoxIstream) -> Result<Bytes, IstreamError> {
    let mut out = bytes::BytesMut::new();
    futures_util::future::poll_fn(|cx| loop {
        match stream.poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => out.extend_from_slice(&chunk),
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
            Poll::Ready(None) => return Poll::Ready(Ok(())),
            Poll::Pending => return Poll::Pending,
        }
    })
    .await?;
    Ok(out.freeze())
}

/// Pull one chunk from the stream.
pub async fn next_chunk(stream: &mut dyn Istream) -> Option<Result<Bytes, IstreamError>> {
    futures_util::future::poll_fn(|cx| stream.poll_data(cx)).await
}

/// An empty stream, immediately at end-of-file.
pub fn empty() -> BoxIstream {
    Box::new(MemoryIstream::new(Bytes::new()))
}

/// A stream over a static string or byte buffer.
pub fn from_bytes(data: impl Into<Bytes>) -> BoxIstream {
    Box::new(MemoryIstream::new(data.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_memory() {
        let s = from_bytes("hello world");
        assert_eq!(collect(s).await.unwrap(), Bytes::from("hello world"));
    }

    #[test]
    fn fd_type_mask() {
        let mask = FdTypeMask::of(&[FdType::File, FdType::Pipe]);
        assert!(mask.contains(FdType::File));
        assert!(mask.contains(FdType::Pipe));
        assert!(!mask.contains(FdType::Tcp));
        assert!(FdTypeMask::NONE.is_empty());
        assert!(FdTypeMask::ANY.contains(FdType::Socket));
    }
}
