use super::{BucketList, DirectSource, FdType, Istream, IstreamError};
use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::task::{Context, Poll};

const READ_CHUNK: usize = 16 * 1024;

/// Streams a byte range of a regular file.
///
/// Reads are positional and synchronous; regular-file reads come from the
/// page cache and do not park the worker in practice. The fd is offered
/// on the direct path so a socket consumer can sendfile() straight out of
/// it.
pub struct FileIstream {
    file: File,
    offset: u64,
    remaining: u64,
}

impl FileIstream {
    pub fn new(file: File, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            remaining: length,
        }
    }

    /// Open `path` and stream all of it.
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::new(file, 0, len))
    }

    fn pread(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe {
            libc::pread(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                self.offset as libc::off_t,
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Istream for FileIstream {
    fn available(&self, _partial: bool) -> Option<u64> {
        Some(self.remaining)
    }

    fn skip(&mut self, n: u64) -> Option<u64> {
        let n = n.min(self.remaining);
        self.offset += n;
        self.remaining -= n;
        Some(n)
    }

    fn poll_data(&mut self, _cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        if self.remaining == 0 {
            return Poll::Ready(None);
        }
        let want = READ_CHUNK.min(self.remaining as usize);
        let mut buf = BytesMut::zeroed(want);
        match self.pread(&mut buf) {
            Ok(0) => Poll::Ready(Some(Err(IstreamError::Premature {
                remaining: self.remaining,
            }))),
            Ok(n) => {
                buf.truncate(n);
                self.offset += n as u64;
                self.remaining -= n as u64;
                Poll::Ready(Some(Ok(buf.freeze())))
            }
            Err(e) => Poll::Ready(Some(Err(IstreamError::Io(e)))),
        }
    }

    fn fill_buckets(&mut self, list: &mut BucketList) -> Result<(), IstreamError> {
        // file contents are not memory-resident
        if self.remaining > 0 {
            list.set_non_buffer();
        }
        Ok(())
    }

    fn direct(&mut self) -> Option<DirectSource> {
        if self.remaining == 0 {
            return None;
        }
        Some(DirectSource {
            fd: self.file.as_raw_fd(),
            kind: FdType::File,
            offset: Some(self.offset),
            remaining: Some(self.remaining),
        })
    }

    fn consume_direct(&mut self, n: usize) {
        debug_assert!(n as u64 <= self.remaining);
        self.offset += n as u64;
        self.remaining -= n as u64;
    }

    fn into_fd(self: Box<Self>) -> Result<(FdType, OwnedFd), super::BoxIstream> {
        if self.offset == 0 {
            Ok((FdType::File, OwnedFd::from(self.file)))
        } else {
            Err(self)
        }
    }
}

/// Expose the raw fd, e.g. for the sendfile fast path.
pub fn file_raw_fd(stream: &FileIstream) -> RawFd {
    stream.file.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::collect;
    use std::io::Write;

    #[tokio::test]
    async fn streams_byte_range() {
        let mut tmp = tempfile();
        tmp.write_all(b"0123456789").unwrap();
        let s = FileIstream::new(tmp, 2, 5);
        assert_eq!(s.available(false), Some(5));
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("23456"));
    }

    #[tokio::test]
    async fn truncated_file_is_premature() {
        let mut tmp = tempfile();
        tmp.write_all(b"short").unwrap();
        let s = FileIstream::new(tmp, 0, 100);
        assert!(matches!(
            collect(Box::new(s)).await,
            Err(IstreamError::Premature { .. })
        ));
    }

    fn tempfile() -> File {
        tempfile_in(std::env::temp_dir())
    }

    fn tempfile_in(dir: std::path::PathBuf) -> File {
        use std::os::unix::io::FromRawFd;
        let path = std::ffi::CString::new(dir.to_str().unwrap()).unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_TMPFILE | libc::O_RDWR, 0o600) };
        assert!(fd >= 0, "O_TMPFILE open failed");
        unsafe { File::from_raw_fd(fd) }
    }
}
