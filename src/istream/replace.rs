use super::{BoxIstream, Istream, IstreamError};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Buffers its source and lets a controller splice replacement streams
/// into byte ranges of it. Output is emitted strictly in source order:
/// kept regions verbatim, replaced regions substituted by the attached
/// stream (or deleted outright).
///
/// The controller advances a *settle* mark telling the stream how far the
/// source has been inspected; bytes beyond the mark are withheld so a
/// late replacement can still claim them. `finish()` settles everything.
pub struct ReplaceIstream {
    source: Option<BoxIstream>,
    control: Arc<Mutex<ControlState>>,

    /// buffered source bytes not yet emitted or discarded, starting at
    /// source offset `buffer_start`
    buffer: BytesMut,
    buffer_start: u64,
    /// total source bytes received
    source_pos: u64,
    /// next source offset to emit
    read_pos: u64,

    substitutions: VecDeque<Substitution>,
    source_eof: bool,
}

struct Substitution {
    id: u64,
    start: u64,
    end: u64,
    stream: Option<BoxIstream>,
}

#[derive(Default)]
struct ControlState {
    pending: Vec<Command>,
    settled_pos: u64,
    finished: bool,
    next_id: u64,
    waker: Option<Waker>,
}

enum Command {
    Add {
        id: u64,
        start: u64,
        end: u64,
        stream: Option<BoxIstream>,
    },
    Extend {
        id: u64,
        end: u64,
    },
}

/// Handle used by the producer side (the processor) to steer a
/// `ReplaceIstream`.
#[derive(Clone)]
pub struct ReplaceControl {
    state: Arc<Mutex<ControlState>>,
}

impl ReplaceControl {
    /// A controller not yet bound to a stream; pair it with
    /// `ReplaceIstream::with_control()`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState::default())),
        }
    }

    /// Replace the source range `[start, end)` with `stream` (`None`
    /// deletes the range). Returns an id usable with `extend()`.
    pub fn add(&self, start: u64, end: u64, stream: Option<BoxIstream>) -> u64 {
        let mut state = self.state.lock().unwrap();
        assert!(!state.finished);
        assert!(start <= end);
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push(Command::Add {
            id,
            start,
            end,
            stream,
        });
        if end > state.settled_pos {
            state.settled_pos = end;
        }
        state.wake();
        id
    }

    /// Grow a previously added replacement region in place.
    pub fn extend(&self, id: u64, end: u64) {
        let mut state = self.state.lock().unwrap();
        assert!(!state.finished);
        state.pending.push(Command::Extend { id, end });
        if end > state.settled_pos {
            state.settled_pos = end;
        }
        state.wake();
    }

    /// Allow output up to source offset `pos`: everything before it is
    /// final and will not be replaced.
    pub fn settle(&self, pos: u64) {
        let mut state = self.state.lock().unwrap();
        if pos > state.settled_pos {
            state.settled_pos = pos;
            state.wake();
        }
    }

    /// No further replacements will be added.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        state.wake();
    }
}

impl ControlState {
    fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }
}

impl Default for ReplaceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplaceIstream {
    pub fn new(source: BoxIstream) -> (ReplaceControl, Self) {
        let control = ReplaceControl::new();
        let stream = Self::with_control(&control, source);
        (control, stream)
    }

    /// Bind a pre-created controller to a source. The source itself may
    /// hold the controller's twin and issue commands while it is being
    /// pulled.
    pub fn with_control(control: &ReplaceControl, source: BoxIstream) -> Self {
        Self {
            source: Some(source),
            control: control.state.clone(),
            buffer: BytesMut::new(),
            buffer_start: 0,
            source_pos: 0,
            read_pos: 0,
            substitutions: VecDeque::new(),
            source_eof: false,
        }
    }

    fn apply_commands(&mut self) {
        let mut state = self.control.lock().unwrap();
        for cmd in state.pending.drain(..) {
            match cmd {
                Command::Add {
                    id,
                    start,
                    end,
                    stream,
                } => {
                    debug_assert!(start >= self.read_pos, "replacement starts in emitted data");
                    debug_assert!(
                        self.substitutions.back().map_or(true, |s| start >= s.end),
                        "replacements must be added in source order"
                    );
                    self.substitutions.push_back(Substitution {
                        id,
                        start,
                        end,
                        stream,
                    });
                }
                Command::Extend { id, end } => {
                    if let Some(sub) = self.substitutions.iter_mut().find(|s| s.id == id) {
                        debug_assert!(end >= sub.end);
                        sub.end = end;
                    }
                }
            }
        }
    }

    /// Drop buffered source bytes that fall inside the leading
    /// substitution's range (they are replaced, never emitted).
    fn discard_replaced(&mut self) {
        let Some(sub) = self.substitutions.front() else {
            return;
        };
        if self.read_pos < sub.start {
            return;
        }
        let drop_until = sub.end.min(self.source_pos);
        if drop_until > self.read_pos {
            let n = (drop_until - self.read_pos) as usize;
            debug_assert!(self.buffer_start == self.read_pos);
            debug_assert!(self.buffer.len() >= n);
            self.buffer.advance(n);
            self.buffer_start += n as u64;
            self.read_pos = drop_until;
        }
    }

    /// Upper bound of plain source data that may currently be emitted.
    fn emit_limit(&self, settled_pos: u64, finished: bool) -> u64 {
        let mut limit = if finished {
            self.source_pos
        } else {
            settled_pos.min(self.source_pos)
        };
        if let Some(sub) = self.substitutions.front() {
            limit = limit.min(sub.start);
        }
        limit
    }
}

impl Istream for ReplaceIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        if !partial {
            return None;
        }
        let (settled, finished) = {
            let state = self.control.lock().unwrap();
            (state.settled_pos, state.finished)
        };
        let limit = self.emit_limit(settled, finished);
        Some(limit.saturating_sub(self.read_pos))
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        loop {
            self.apply_commands();

            let (settled, finished) = {
                let state = self.control.lock().unwrap();
                (state.settled_pos, state.finished)
            };

            // 1. emit plain source data before the next substitution
            let limit = self.emit_limit(settled, finished);
            if limit > self.read_pos {
                let n = (limit - self.read_pos) as usize;
                debug_assert!(self.buffer_start == self.read_pos);
                debug_assert!(self.buffer.len() >= n);
                let chunk = self.buffer.split_to(n).freeze();
                self.buffer_start += n as u64;
                self.read_pos = limit;
                return Poll::Ready(Some(Ok(chunk)));
            }

            // 2. drive the active substitution
            if let Some(sub) = self.substitutions.front_mut() {
                if self.read_pos >= sub.start {
                    if let Some(stream) = sub.stream.as_mut() {
                        match stream.poll_data(cx) {
                            Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                            Poll::Ready(None) => sub.stream = None,
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    // substitution body drained; skip the replaced range
                    // once the source has caught up with its end
                    if sub.end <= self.source_pos {
                        let sub_end = sub.end;
                        self.discard_replaced();
                        if self.read_pos >= sub_end {
                            // the region may still be extended while the
                            // controller sits exactly at its end; pop only
                            // once the controller has moved past it
                            let mut state = self.control.lock().unwrap();
                            let closed = state.finished || state.settled_pos > sub_end;
                            if !closed {
                                if state.pending.is_empty() {
                                    state.waker = Some(cx.waker().clone());
                                    return Poll::Pending;
                                }
                                drop(state);
                                continue;
                            }
                            drop(state);
                            self.substitutions.pop_front();
                        }
                        continue;
                    }
                }
            }

            // 3. pull more source data
            if !self.source_eof {
                let Some(source) = self.source.as_mut() else {
                    unreachable!()
                };
                match source.poll_data(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        self.source_pos += chunk.len() as u64;
                        self.buffer.extend_from_slice(&chunk);
                        self.discard_replaced();
                        continue;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        self.source = None;
                        self.source_eof = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        self.source_eof = true;
                        self.source = None;
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            // 4. source exhausted: wait for the controller to finish
            if finished && self.substitutions.is_empty() && self.read_pos >= self.source_pos {
                return Poll::Ready(None);
            }
            if !finished {
                let mut state = self.control.lock().unwrap();
                if state.pending.is_empty() && !state.finished {
                    state.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                continue;
            }

            // finished, but a substitution at EOF is still pending
            if let Some(sub) = self.substitutions.front_mut() {
                debug_assert!(sub.end >= self.source_pos || sub.stream.is_some());
                if sub.stream.is_none() {
                    self.discard_replaced();
                    self.substitutions.pop_front();
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes};

    fn run(setup: impl FnOnce(&ReplaceControl)) -> Bytes {
        let (control, stream) = ReplaceIstream::new(from_bytes("hello cruel world"));
        setup(&control);
        control.finish();
        tokio_test::block_on(collect(Box::new(stream))).unwrap()
    }

    #[test]
    fn passthrough_without_replacements() {
        assert_eq!(run(|_| {}), Bytes::from("hello cruel world"));
    }

    #[test]
    fn replaces_middle_range() {
        // "cruel" is bytes 6..11
        assert_eq!(
            run(|c| {
                c.add(6, 11, Some(from_bytes("kind")));
            }),
            Bytes::from("hello kind world")
        );
    }

    #[test]
    fn deletes_range() {
        assert_eq!(
            run(|c| {
                c.add(5, 11, None);
            }),
            Bytes::from("hello world")
        );
    }

    #[test]
    fn multiple_replacements_in_order() {
        assert_eq!(
            run(|c| {
                c.add(0, 5, Some(from_bytes("bye")));
                c.add(6, 11, Some(from_bytes("kind")));
            }),
            Bytes::from("bye kind world")
        );
    }

    #[test]
    fn insertion_at_point() {
        // zero-width range inserts without consuming source bytes
        assert_eq!(
            run(|c| {
                c.add(5, 5, Some(from_bytes(",")));
            }),
            Bytes::from("hello, cruel world")
        );
    }

    #[test]
    fn extend_grows_replaced_range() {
        let (control, stream) = ReplaceIstream::new(from_bytes("abcdef"));
        let id = control.add(1, 2, Some(from_bytes("X")));
        control.extend(id, 5);
        control.finish();
        let out = tokio_test::block_on(collect(Box::new(stream))).unwrap();
        assert_eq!(out, Bytes::from("aXf"));
    }

    #[tokio::test]
    async fn output_withheld_until_settled() {
        use futures_util::FutureExt;

        let (control, mut stream) = ReplaceIstream::new(from_bytes("abcdef"));
        // nothing settled yet: no output even though the source is ready
        assert!(futures_util::future::poll_fn(|cx| stream.poll_data(cx))
            .now_or_never()
            .is_none());

        control.settle(3);
        let chunk = crate::istream::next_chunk(&mut stream).await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from("abc"));

        control.finish();
        let chunk = crate::istream::next_chunk(&mut stream).await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from("def"));
        assert!(crate::istream::next_chunk(&mut stream).await.is_none());
    }
}
