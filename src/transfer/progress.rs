use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Invoked with (current, total, bytes-per-second).
pub type ProgressCallback = Box<dyn FnMut(i64, i64, f64) + Send>;

/// Pass-through byte counter. Fires the callback on the first read, then at
/// most every `PROGRESS_INTERVAL`, and once more at end of stream.
pub struct ProgressReader<R> {
    inner: R,
    total: i64,
    current: i64,
    last_len: i64,
    last_emit: Option<Instant>,
    started: Instant,
    finished: bool,
    callback: ProgressCallback,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: i64, callback: impl FnMut(i64, i64, f64) + Send + 'static) -> Self {
        Self {
            inner,
            total,
            current: 0,
            last_len: 0,
            last_emit: None,
            started: Instant::now(),
            finished: false,
            callback: Box::new(callback),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                this.current += read as i64;
                let eof = read == 0;
                let due = this
                    .last_emit
                    .map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL);
                if (due || eof) && !this.finished {
                    let elapsed = this
                        .last_emit
                        .unwrap_or(this.started)
                        .elapsed()
                        .as_secs_f64();
                    let speed = if elapsed > 0.0 {
                        (this.current - this.last_len) as f64 / elapsed
                    } else {
                        0.0
                    };
                    (this.callback)(this.current, this.total, speed);
                    this.last_emit = Some(Instant::now());
                    this.last_len = this.current;
                    if eof {
                        this.finished = true;
                    }
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

/// Why an upload-side copy failed. The handler picks its reply (or stays
/// silent) based on which signal fired, so the two cancellation sources stay
/// separable from plain disk errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    None,
    /// The engine-scoped cancel fired: the receiving user backed out.
    Canceled,
    /// The request body errored underneath us: the sender went away.
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct FailureFlag(Arc<AtomicU8>);

impl FailureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, failure: UploadFailure) {
        let value = match failure {
            UploadFailure::None => 0,
            UploadFailure::Canceled => 1,
            UploadFailure::Disconnected => 2,
        };
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> UploadFailure {
        match self.0.load(Ordering::SeqCst) {
            1 => UploadFailure::Canceled,
            2 => UploadFailure::Disconnected,
            _ => UploadFailure::None,
        }
    }
}

/// Wraps the request body so an engine-scoped cancel interrupts a blocked
/// read, and records whether a failure came from the cancel or from the
/// network side.
pub struct CancelReader<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    flag: FailureFlag,
}

impl<R> CancelReader<R> {
    pub fn new(inner: R, token: CancellationToken, flag: FailureFlag) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
            flag,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancelReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.flag.set(UploadFailure::Canceled);
            // not ErrorKind::Interrupted: sync readers layered over the
            // bridge would retry that kind forever
            return Poll::Ready(Err(io::Error::other("transfer canceled")));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => {
                this.flag.set(UploadFailure::Disconnected);
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }
}
