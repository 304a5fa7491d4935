use super::{Istream, IstreamError};
use bytes::Bytes;
use std::task::{Context, Poll};

/// A stream that fails on the first read. Used to inject an error that
/// was detected before the stream was handed to its consumer.
pub struct FailIstream {
    error: Option<IstreamError>,
}

impl FailIstream {
    pub fn new(error: IstreamError) -> Self {
        Self { error: Some(error) }
    }
}

impl Istream for FailIstream {
    fn available(&self, _partial: bool) -> Option<u64> {
        None
    }

    fn poll_data(&mut self, _cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        match self.error.take() {
            Some(e) => Poll::Ready(Some(Err(e))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::collect;

    #[tokio::test]
    async fn fails_immediately() {
        let s = Box::new(FailIstream::new(IstreamError::msg("nope")));
        assert!(collect(s).await.is_err());
    }
}
