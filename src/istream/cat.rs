use super::{BoxIstream, BucketList, DirectSource, Istream, IstreamError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::task::{Context, Poll};

/// Logical concatenation of several streams. Forwards `available` as the
/// sum, forwards the direct-fd path of the current head transparently and
/// switches to the next input on EOF.
pub struct CatIstream {
    inputs: VecDeque<BoxIstream>,
}

impl CatIstream {
    pub fn new(inputs: impl IntoIterator<Item = BoxIstream>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
        }
    }
}

impl Istream for CatIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        let mut sum = 0u64;
        for input in &self.inputs {
            match input.available(partial) {
                Some(n) => sum += n,
                None if partial => {
                    // lower bound: unknown inputs contribute nothing
                }
                None => return None,
            }
        }
        Some(sum)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let front = self.inputs.front_mut()?;
        front.skip(n)
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            let Some(front) = self.inputs.front_mut() else {
                return Poll::Ready(None);
            };
            match front.poll_data(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => {
                    self.inputs.pop_front();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn fill_buckets(&mut self, list: &mut BucketList) -> Result<(), IstreamError> {
        for input in self.inputs.iter_mut() {
            input.fill_buckets(list)?;
            if list.has_more() {
                break;
            }
        }
        Ok(())
    }

    fn consume_buckets(&mut self, mut n: usize) -> usize {
        let mut total = 0;
        while n > 0 {
            let Some(front) = self.inputs.front_mut() else {
                break;
            };
            let consumed = front.consume_buckets(n);
            total += consumed;
            n -= consumed;
            if n > 0 {
                // the head is exhausted, the remainder belongs to siblings
                self.inputs.pop_front();
            }
        }
        total
    }

    fn direct(&mut self) -> Option<DirectSource> {
        self.inputs.front_mut()?.direct()
    }

    fn consume_direct(&mut self, n: usize) {
        if let Some(front) = self.inputs.front_mut() {
            front.consume_direct(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes};

    #[tokio::test]
    async fn concatenates_in_order() {
        let cat = CatIstream::new([from_bytes("foo"), from_bytes(""), from_bytes("bar")]);
        assert_eq!(cat.available(false), Some(6));
        assert_eq!(collect(Box::new(cat)).await.unwrap(), Bytes::from("foobar"));
    }

    #[test]
    fn bucket_consumption_spans_inputs() {
        let mut cat = CatIstream::new([from_bytes("abc"), from_bytes("defg")]);
        let mut list = BucketList::default();
        cat.fill_buckets(&mut list).unwrap();
        assert_eq!(list.total_size(), 7);

        // consume across the boundary of the first input
        assert_eq!(cat.consume_buckets(5), 5);
        assert_eq!(cat.available(false), Some(2));
    }

    #[tokio::test]
    async fn empty_cat_is_eof() {
        let cat = CatIstream::new([]);
        assert_eq!(collect(Box::new(cat)).await.unwrap(), Bytes::new());
    }
}
