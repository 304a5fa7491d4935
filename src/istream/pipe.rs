use super::{BoxIstream, DirectSource, FdType, Istream, IstreamError};
use bytes::{Bytes, BytesMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Create a non-blocking pipe pair (read end, write end).
pub fn pipe_pair() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// sendfile() from a seekable fd at `offset` into `out_fd`.
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: usize) -> std::io::Result<usize> {
    let mut off = offset as libc::off_t;
    let n = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// splice() between two streaming fds (at least one must be a pipe).
pub fn splice(in_fd: RawFd, out_fd: RawFd, count: usize) -> std::io::Result<usize> {
    let n = unsafe {
        libc::splice(
            in_fd,
            std::ptr::null_mut(),
            out_fd,
            std::ptr::null_mut(),
            count,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// splice() out of a seekable fd at an explicit offset into a pipe.
pub fn splice_from_file(
    in_fd: RawFd,
    offset: u64,
    out_fd: RawFd,
    count: usize,
) -> std::io::Result<usize> {
    let mut off = offset as libc::loff_t;
    let n = unsafe {
        libc::splice(
            in_fd,
            &mut off,
            out_fd,
            std::ptr::null_mut(),
            count,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Process-wide pool of pipe pairs, amortising pipe2() when bridging
/// incompatible direct-transfer endpoints.
pub struct PipeStock {
    idle: Mutex<Vec<(OwnedFd, OwnedFd)>>,
    limit: usize,
}

impl PipeStock {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            limit,
        })
    }

    pub fn get(&self) -> std::io::Result<(OwnedFd, OwnedFd)> {
        if let Some(pair) = self.idle.lock().unwrap().pop() {
            return Ok(pair);
        }
        pipe_pair()
    }

    /// Return a drained pipe pair for reuse.
    pub fn put(&self, pair: (OwnedFd, OwnedFd)) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.limit {
            idle.push(pair);
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// Interposes a pipe so a source whose fd type the sink refuses (e.g. a
/// regular file offered to a consumer that only splices from pipes) can
/// still use the zero-copy path.
pub struct AutoPipeIstream {
    input: BoxIstream,
    stock: Arc<PipeStock>,
    pipe: Option<(OwnedFd, OwnedFd)>,
    in_pipe: usize,
    input_eof: bool,
}

impl AutoPipeIstream {
    pub fn new(input: BoxIstream, stock: Arc<PipeStock>) -> Self {
        Self {
            input,
            stock,
            pipe: None,
            in_pipe: 0,
            input_eof: false,
        }
    }

    fn release_pipe(&mut self) {
        if let Some(pair) = self.pipe.take() {
            if self.in_pipe == 0 {
                self.stock.put(pair);
            }
        }
    }

    /// Pull bytes from the source fd into our pipe. Returns how many
    /// bytes were moved.
    fn refill(&mut self) -> std::io::Result<usize> {
        let Some(src) = self.input.direct() else {
            return Ok(0);
        };
        if self.pipe.is_none() {
            self.pipe = Some(self.stock.get()?);
        }
        let (_, write_end) = self.pipe.as_ref().unwrap();
        let max = src
            .remaining
            .map(|r| (r as usize).min(256 * 1024))
            .unwrap_or(256 * 1024);
        if max == 0 {
            self.input_eof = true;
            return Ok(0);
        }
        let moved = match src.offset {
            Some(off) => splice_from_file(src.fd, off, write_end.as_raw_fd(), max),
            None => splice(src.fd, write_end.as_raw_fd(), max),
        };
        match moved {
            Ok(0) => {
                self.input_eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.input.consume_direct(n);
                self.in_pipe += n;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Istream for AutoPipeIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        self.input
            .available(partial)
            .map(|n| n + self.in_pipe as u64)
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        if self.in_pipe > 0 {
            let (read_end, _) = self.pipe.as_ref().unwrap();
            let mut buf = BytesMut::zeroed(self.in_pipe.min(16 * 1024));
            let n = unsafe {
                libc::read(
                    read_end.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                buf.truncate(n as usize);
                self.in_pipe -= n as usize;
                if self.in_pipe == 0 && self.input_eof {
                    self.release_pipe();
                }
                return Poll::Ready(Some(Ok(buf.freeze())));
            }
        }
        if self.input_eof {
            self.release_pipe();
            return Poll::Ready(None);
        }
        match self.input.poll_data(cx) {
            Poll::Ready(None) => {
                self.input_eof = true;
                self.release_pipe();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn direct(&mut self) -> Option<DirectSource> {
        if self.in_pipe == 0 && !self.input_eof {
            if self.refill().is_err() {
                return None;
            }
        }
        if self.in_pipe == 0 {
            return None;
        }
        let (read_end, _) = self.pipe.as_ref().unwrap();
        Some(DirectSource {
            fd: read_end.as_raw_fd(),
            kind: FdType::Pipe,
            offset: None,
            remaining: Some(self.in_pipe as u64),
        })
    }

    fn consume_direct(&mut self, n: usize) {
        debug_assert!(n <= self.in_pipe);
        self.in_pipe -= n;
        if self.in_pipe == 0 && self.input_eof {
            self.release_pipe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_reuses_pairs() {
        let stock = PipeStock::new(4);
        let pair = stock.get().unwrap();
        stock.put(pair);
        assert_eq!(stock.idle_count(), 1);
        let _pair = stock.get().unwrap();
        assert_eq!(stock.idle_count(), 0);
    }

    #[test]
    fn splice_moves_bytes_between_pipes() {
        let (r1, w1) = pipe_pair().unwrap();
        let (r2, w2) = pipe_pair().unwrap();
        let written = unsafe {
            libc::write(
                w1.as_raw_fd(),
                b"zero copy".as_ptr() as *const libc::c_void,
                9,
            )
        };
        assert_eq!(written, 9);
        drop(w1);

        let moved = splice(r1.as_raw_fd(), w2.as_raw_fd(), 64).unwrap();
        assert_eq!(moved, 9);
        drop(w2);

        let mut buf = [0u8; 64];
        let n =
            unsafe { libc::read(r2.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 64) };
        assert_eq!(&buf[..n as usize], b"zero copy");
    }
}
