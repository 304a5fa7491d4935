use super::{BoxIstream, Istream, IstreamError};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Fan a source out to two sinks receiving byte-identical streams.
///
/// The source is only pulled again once both sinks have taken the current
/// chunk; a sink that lags behind creates back-pressure on the other. A
/// dropped sink releases the pressure so the survivor can drain alone.
pub fn tee(source: BoxIstream) -> (TeeIstream, TeeIstream) {
    let shared = Arc::new(Mutex::new(TeeShared {
        source: Some(source),
        chunk: None,
        taken: [false; 2],
        closed: [false; 2],
        error: None,
        eof: false,
        wakers: [None, None],
    }));
    (
        TeeIstream {
            shared: shared.clone(),
            index: 0,
            done: false,
        },
        TeeIstream {
            shared,
            index: 1,
            done: false,
        },
    )
}

struct TeeShared {
    source: Option<BoxIstream>,
    chunk: Option<Bytes>,
    taken: [bool; 2],
    closed: [bool; 2],
    error: Option<Arc<IstreamError>>,
    eof: bool,
    wakers: [Option<Waker>; 2],
}

impl TeeShared {
    fn wake_other(&mut self, index: usize) {
        if let Some(w) = self.wakers[1 - index].take() {
            w.wake();
        }
    }

    fn chunk_settled(&mut self) {
        let all_taken = (0..2).all(|i| self.taken[i] || self.closed[i]);
        if all_taken {
            self.chunk = None;
        }
    }
}

pub struct TeeIstream {
    shared: Arc<Mutex<TeeShared>>,
    index: usize,
    done: bool,
}

impl Istream for TeeIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        let shared = self.shared.lock().unwrap();
        let pending = match &shared.chunk {
            Some(c) if !shared.taken[self.index] => c.len() as u64,
            _ => 0,
        };
        match &shared.source {
            Some(source) => source.available(partial).map(|n| n + pending),
            None => Some(pending),
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        if self.done {
            return Poll::Ready(None);
        }
        let mut shared = self.shared.lock().unwrap();

        // take the chunk currently in flight, if we have not yet
        if let Some(chunk) = shared.chunk.clone() {
            if !shared.taken[self.index] {
                shared.taken[self.index] = true;
                shared.chunk_settled();
                shared.wake_other(self.index);
                return Poll::Ready(Some(Ok(chunk)));
            }
            // waiting for the sibling to take its copy
            shared.wakers[self.index] = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if let Some(e) = &shared.error {
            self.done = true;
            return Poll::Ready(Some(Err(IstreamError::Shared(e.clone()))));
        }
        if shared.eof {
            self.done = true;
            return Poll::Ready(None);
        }

        let Some(source) = shared.source.as_mut() else {
            self.done = true;
            return Poll::Ready(None);
        };
        match source.poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                shared.taken = [false; 2];
                shared.taken[self.index] = true;
                shared.chunk = Some(chunk.clone());
                shared.chunk_settled();
                shared.wake_other(self.index);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e = Arc::new(e);
                shared.error = Some(e.clone());
                shared.source = None;
                shared.wake_other(self.index);
                self.done = true;
                Poll::Ready(Some(Err(IstreamError::Shared(e))))
            }
            Poll::Ready(None) => {
                shared.eof = true;
                shared.source = None;
                shared.wake_other(self.index);
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                shared.wakers[self.index] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TeeIstream {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed[self.index] = true;
        shared.chunk_settled();
        shared.wake_other(self.index);
    }
}
