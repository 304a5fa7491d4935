use super::{BoxIstream, Istream, IstreamError};
use bytes::Bytes;
use std::task::{Context, Poll};
use tracing::debug;

/// Swallows errors from the wrapped stream and substitutes a clean end of
/// stream, so a failing embedded fragment cannot abort the surrounding
/// response. The error is reported to the callback once.
pub struct CatchIstream {
    input: Option<BoxIstream>,
    on_error: Option<Box<dyn FnOnce(IstreamError) + Send + Sync>>,
}

impl CatchIstream {
    pub fn new(
        input: BoxIstream,
        on_error: impl FnOnce(IstreamError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            input: Some(input),
            on_error: Some(Box::new(on_error)),
        }
    }
}

impl Istream for CatchIstream {
    fn available(&self, partial: bool) -> Option<u64> {
        match &self.input {
            // the total is unknowable: an error may truncate the stream
            Some(input) if partial => input.available(true),
            _ => None,
        }
    }

    fn poll_data(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, IstreamError>>> {
        let Some(input) = self.input.as_mut() else {
            return Poll::Ready(None);
        };
        match input.poll_data(cx) {
            Poll::Ready(Some(Err(e))) => {
                debug!("catch: suppressing stream error: {}", e);
                self.input = None;
                if let Some(cb) = self.on_error.take() {
                    cb(e);
                }
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.input = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::istream::{collect, from_bytes, CatIstream, FailIstream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn error_becomes_eof() {
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        let inner = CatIstream::new([
            from_bytes("partial"),
            Box::new(FailIstream::new(IstreamError::msg("backend died"))) as BoxIstream,
        ]);
        let s = CatchIstream::new(Box::new(inner), move |_| {
            seen2.store(true, Ordering::SeqCst);
        });
        assert_eq!(collect(Box::new(s)).await.unwrap(), Bytes::from("partial"));
        assert!(seen.load(Ordering::SeqCst));
    }
}
