//! Byte-counting wrapper around an upload body stream.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Receives the running byte count of the current upload.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// A callback that ignores every update
pub fn noop_callback() -> ProgressCallback {
    Arc::new(|_| {})
}

/// Counts bytes as the HTTP client pulls chunks and reports them through a
/// [`ProgressCallback`], throttled to one call per interval. The final count
/// is always reported when the stream ends.
pub struct ProgressStream<S> {
    inner: S,
    bytes_sent: u64,
    last_report: Option<Instant>,
    interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self::with_interval(inner, callback, Duration::from_millis(250))
    }

    pub fn with_interval(inner: S, callback: ProgressCallback, interval: Duration) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            last_report: None,
            interval,
            callback,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn report(&mut self, force: bool) {
        let now = Instant::now();
        let due = match self.last_report {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        };
        if force || due {
            (self.callback)(self.bytes_sent);
            self.last_report = Some(now);
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_sent += chunk.len() as u64;
                self.report(false);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                self.report(true);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
