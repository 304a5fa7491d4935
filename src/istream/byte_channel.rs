use super::{Istream, IstreamError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Bounded in-process byte conduit connecting a producer task (e.g. the
/// connection that decodes request-body framing) to a consumer holding an
/// `Istream`. Capacity is counted in bytes; a full channel exerts
/// back-pressure on the producer.
pub fn byte_channel(capacity: usize) -> (ByteSender, ChannelIstream) {
    let shared = Arc::new(Mutex::new(ChannelShared {
        queue: VecDeque::new(),
        buffered: 0,
        capacity,
        total_remaining: None,
        closed: false,
        error: None,
        receiver_gone: false,
        pull_started: false,
        recv_waker: None,
        send_waker: None,
        start_waker: None,
    }));
    (
        ByteSender {
            shared: shared.clone(),
        },
        ChannelIstream { shared },
    )
}

struct ChannelShared {
    queue: VecDeque<Bytes>,
    buffered: usize,
    capacity: usize,
    /// announced number of bytes still to come (content-length minus
    /// what was already queued + delivered), if known
    total_remaining: Option<u64>,
    closed: bool,
    error: Option<IstreamError>,
    receiver_gone: bool,
    /// set on the consumer's first pull; drives deferred 100-continue
    pull_started: bool,
    recv_waker: Option<Waker>,
    send_waker: Option<Waker>,
    start_waker: Option<Waker>,
}

impl ChannelShared {
    fn wake_recv(&mut self) {
        if let Some(w) = self.recv_waker.take() {
            w.wake();
        }
    }

    fn wake_send(&mut self) {
        if let Some(w) = self.send_waker.take() {
            w.wake();
        }
    }
}

pub struct ByteSender {
    shared: Arc<Mutex<ChannelShared>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReceiverGone;

impl ByteSender {
    /// Announce the total number of bytes that will be sent, so the
    /// consumer can answer `available(false)` exactly.
    pub fn set_total(&self, total: u64) {
        self.shared.lock().unwrap().total_remaining = Some(total);
    }

    /// Queue a chunk, waiting while the channel is over capacity.
    pub async fn send(&mut self, data: Bytes) -> Result<(), ReceiverGone> {
        if data.is_empty() {
            return Ok(());
        }
        loop {
            let parked = {
                let mut shared = self.shared.lock().unwrap();
                if shared.receiver_gone {
                    return Err(ReceiverGone);
                }
                if shared.buffered < shared.capacity {
                    shared.buffered += data.len();
                    if let Some(t) = &mut shared.total_remaining {
                        *t = t.saturating_sub(data.len() as u64);
                    }
                    shared.queue.push_back(data);
                    shared.wake_recv();
                    return Ok(());
                }
                true
            };
            if parked {
                futures_util::future::poll_fn(|cx| {
                    let mut shared = self.shared.lock().unwrap();
                    if shared.receiver_gone || shared.buffered < shared.capacity {
                        Poll::Ready(())
                    } else {
                        shared.send_waker = Some(cx.waker().clone());
                        Poll::Pending
                    }
                })
                .await;
            }
        }
    }

    /// End of stream; the consumer sees EOF once the queue drains.
    pub fn close(self) {
        let mut shared = self.shared.lock().unwrap();
        shared.closed = true;
        shared.wake_recv();
    }

    /// Abort the stream with an error.
    pub fn fail(self, error: IstreamError) {
        let mut shared = self.shared.lock().unwrap();
        shared.error = Some(error);
        shared.closed = true;
        shared.wake_recv();
    }

    pub fn is_receiver_gone(&self) -> bool {
        self.shared.lock().unwrap().receiver_gone
    }

    /// Wait until the consumer pulls for the first time. The server uses
    /// this to defer `100 Continue` until the handler actually reads the
    /// request body.
    pub async fn wait_pull_started(&self) -> Result<(), ReceiverGone> {
        futures_util::future::poll_fn(|cx| {
            let mut shared = self.shared.lock().unwrap();
            if shared.pull_started {
                Poll::Ready(Ok(()))
            } else if shared.receiver_gone {
                Poll::Ready(Err(ReceiverGone))
            } else {
                shared.start_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }
}

pub struct ChannelIstream {
    shared: Arc<Mutex<ChannelShared>>,
}

impl Istream for ChannelIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        let shared = self.shared.lock().unwrap();
        let buffered = shared.buffered as u64;
        if partial {
            Some(buffered)
        } else if shared.closed && shared.error.is_none() {
            Some(buffered)
        } else {
            shared.total_remaining.map(|t| t + buffered)
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.pull_started {
            shared.pull_started = true;
            if let Some(w) = shared.start_waker.take() {
                w.wake();
            }
        }
        if let Some(chunk) = shared.queue.pop_front() {
            shared.buffered -= chunk.len();
            shared.wake_send();
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let Some(e) = shared.error.take() {
            return Poll::Ready(Some(Err(e)));
        }
        if shared.closed {
            return Poll::Ready(None);
        }
        shared.recv_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ChannelIstream {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.receiver_gone = true;
        shared.queue.clear();
        shared.buffered = 0;
        shared.wake_send();
        if let Some(w) = shared.start_waker.take() {
            w.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::collect;

    #[tokio::test]
    async fn transfers_and_closes() {
        let (mut tx, rx) = byte_channel(64);
        let producer = tokio::spawn(async move {
            tx.send(Bytes::from("hello ")).await.unwrap();
            tx.send(Bytes::from("world")).await.unwrap();
            tx.close();
        });
        assert_eq!(
            collect(Box::new(rx)).await.unwrap(),
            Bytes::from("hello world")
        );
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn backpressure_blocks_sender() {
        let (mut tx, mut rx) = byte_channel(4);
        tx.send(Bytes::from("abcd")).await.unwrap();

        // channel is at capacity now; the next send must park until the
        // consumer pulls
        let mut second = tokio_test::task::spawn(tx.send(Bytes::from("efgh")));
        assert!(second.poll().is_pending());

        let chunk = crate::istream::next_chunk(&mut rx).await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from("abcd"));
        assert!(second.is_woken());
        assert!(second.poll().is_ready());
    }

    #[tokio::test]
    async fn receiver_drop_unblocks_sender() {
        let (mut tx, rx) = byte_channel(1);
        tx.send(Bytes::from("x")).await.unwrap();
        drop(rx);
        assert_eq!(tx.send(Bytes::from("y")).await, Err(ReceiverGone));
    }

    #[tokio::test]
    async fn error_reaches_consumer() {
        let (tx, rx) = byte_channel(16);
        tx.fail(IstreamError::msg("upstream reset"));
        assert!(collect(Box::new(rx)).await.is_err());
    }
}
