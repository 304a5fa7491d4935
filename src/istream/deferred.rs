use super::{BoxIstream, Istream, IstreamError};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A placeholder stream whose real input arrives later, e.g. once an
/// embedded sub-request has produced its response body.
pub fn deferred() -> (DeferredFill, DeferredIstream) {
    let shared = Arc::new(Mutex::new(DeferredShared {
        inner: None,
        error: None,
        abandoned: false,
        waker: None,
    }));
    (
        DeferredFill {
            shared: shared.clone(),
        },
        DeferredIstream { shared },
    )
}

struct DeferredShared {
    inner: Option<BoxIstream>,
    error: Option<IstreamError>,
    abandoned: bool,
    waker: Option<Waker>,
}

/// Producer half: fulfil or fail the pending stream.
pub struct DeferredFill {
    shared: Arc<Mutex<DeferredShared>>,
}

impl DeferredFill {
    pub fn set(self, stream: BoxIstream) {
        let mut shared = self.shared.lock().unwrap();
        shared.inner = Some(stream);
        if let Some(w) = shared.waker.take() {
            w.wake();
        }
    }

    pub fn fail(self, error: IstreamError) {
        let mut shared = self.shared.lock().unwrap();
        shared.error = Some(error);
        if let Some(w) = shared.waker.take() {
            w.wake();
        }
    }

    /// True when the consumer side has been dropped; producing a value
    /// would go nowhere.
    pub fn is_abandoned(&self) -> bool {
        self.shared.lock().unwrap().abandoned
    }
}

pub struct DeferredIstream {
    shared: Arc<Mutex<DeferredShared>>,
}

impl Istream for DeferredIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        let shared = self.shared.lock().unwrap();
        match &shared.inner {
            Some(inner) => inner.available(partial),
            None if partial => Some(0),
            None => None,
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(e) = shared.error.take() {
            return Poll::Ready(Some(Err(e)));
        }
        match shared.inner.as_mut() {
            Some(inner) => inner.poll_data(cx),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for DeferredIstream {
    fn drop(&mut self) {
        self.shared.lock().unwrap().abandoned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes};

    #[tokio::test]
    async fn fulfilled_later() {
        let (fill, stream) = deferred();
        let reader = tokio::spawn(collect(Box::new(stream) as BoxIstream));
        tokio::task::yield_now().await;
        fill.set(from_bytes("late"));
        assert_eq!(reader.await.unwrap().unwrap(), Bytes::from("late"));
    }

    #[tokio::test]
    async fn failure_propagates() {
        let (fill, stream) = deferred();
        fill.fail(IstreamError::msg("never came"));
        assert!(collect(Box::new(stream)).await.is_err());
    }
}
