use super::{BucketList, Istream, IstreamError};
use bytes::{Buf, Bytes};
use std::task::{Context, Poll};

/// A stream over an in-memory buffer. EOF follows the final (single)
/// data chunk.
pub struct MemoryIstream {
    data: Bytes,
    done: bool,
}

impl MemoryIstream {
    pub fn new(data: Bytes) -> Self {
        Self { data, done: false }
    }
}

impl Istream for MemoryIstream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let n = (n as usize).min(self.data.len());
        self.data.advance(n);
        Some(n as u64)
    }

    fn poll_data(&mut self, _cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        if self.done || self.data.is_empty() {
            self.done = true;
            return Poll::Ready(None);
        }
        self.done = true;
        Poll::Ready(Some(Ok(std::mem::take(&mut self.data))))
    }

    fn fill_buckets(&mut self, list: &mut BucketList) -> Result<(), IstreamError> {
        list.push(self.data.clone());
        Ok(())
    }

    fn consume_buckets(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        self.data.advance(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, BucketList};

    #[tokio::test]
    async fn delivers_once_then_eof() {
        let s = Box::new(MemoryIstream::new(Bytes::from("abc")));
        assert_eq!(s.available(false), Some(3));
        assert_eq!(collect(s).await.unwrap(), Bytes::from("abc"));
    }

    #[test]
    fn buckets_peek_without_consuming() {
        let mut s = MemoryIstream::new(Bytes::from("abcdef"));
        let mut list = BucketList::default();
        s.fill_buckets(&mut list).unwrap();
        assert_eq!(list.total_size(), 6);
        assert!(!list.has_more());

        assert_eq!(s.consume_buckets(4), 4);
        assert_eq!(s.available(false), Some(2));

        let mut list = BucketList::default();
        s.fill_buckets(&mut list).unwrap();
        assert_eq!(list.total_size(), 2);
    }

    #[test]
    fn skip_probe() {
        let mut s = MemoryIstream::new(Bytes::from("abcd"));
        assert_eq!(s.skip(0), Some(0));
        assert_eq!(s.skip(3), Some(3));
        assert_eq!(s.available(false), Some(1));
    }
}
