//! Connection rate limiting.
//!
//! A [`RateLimiter`] is a per-second token bucket shared by every
//! connection of a torrent, one per direction. [`Throttled`] wraps a
//! transport stream and applies the budget by shrinking the read or write
//! window of the current iteration; when the direction is paused (a zero
//! limit) or the budget is exhausted, it sleeps a short bounded interval
//! before re-checking instead of busy-spinning or blocking unboundedly.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Mutex,
    task::{ready, Context, Poll},
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Sleep},
};

use crate::conf::Limit;

/// How long a read waits when the inbound budget is exhausted or paused.
const READ_PAUSE: Duration = Duration::from_millis(100);
/// How long a write waits when the outbound budget is exhausted or paused.
const WRITE_PAUSE: Duration = Duration::from_millis(500);

/// Outcome of asking the limiter for budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Allowance {
    /// Proceed with at most this many bytes.
    Granted(usize),
    /// No budget right now; wait briefly and ask again.
    Paused,
}

struct Bucket {
    limit: Limit,
    available: u64,
    refilled_at: Instant,
}

/// Shared per-second byte budget for one transfer direction.
pub(crate) struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: Limit) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                limit,
                available: match limit {
                    Limit::Unlimited => 0,
                    Limit::BytesPerSec(n) => u64::from(n),
                },
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> Limit {
        self.bucket.lock().expect("limiter lock poisoned").limit
    }

    /// Replaces the limit; takes effect on the next allowance check of each
    /// connection.
    pub fn set_limit(&self, limit: Limit) {
        let mut bucket = self.bucket.lock().expect("limiter lock poisoned");
        bucket.limit = limit;
        if let Limit::BytesPerSec(n) = limit {
            bucket.available = bucket.available.min(u64::from(n));
        }
    }

    pub fn allowance(&self, want: usize) -> Allowance {
        let mut bucket = self.bucket.lock().expect("limiter lock poisoned");
        match bucket.limit {
            Limit::Unlimited => Allowance::Granted(want),
            Limit::BytesPerSec(0) => Allowance::Paused,
            Limit::BytesPerSec(rate) => {
                if bucket.refilled_at.elapsed() >= Duration::from_secs(1) {
                    bucket.available = u64::from(rate);
                    bucket.refilled_at = Instant::now();
                }
                if bucket.available == 0 {
                    Allowance::Paused
                } else {
                    Allowance::Granted((want as u64).min(bucket.available) as usize)
                }
            }
        }
    }

    pub fn consume(&self, n: usize) {
        let mut bucket = self.bucket.lock().expect("limiter lock poisoned");
        bucket.available = bucket.available.saturating_sub(n as u64);
    }
}

/// A transport stream with both directions subject to rate limits.
pub(crate) struct Throttled<T> {
    inner: T,
    down: std::sync::Arc<RateLimiter>,
    up: std::sync::Arc<RateLimiter>,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<T> Throttled<T> {
    pub fn new(
        inner: T,
        down: std::sync::Arc<RateLimiter>,
        up: std::sync::Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner,
            down,
            up,
            read_delay: None,
            write_delay: None,
        }
    }
}

fn start_pause(
    slot: &mut Option<Pin<Box<Sleep>>>,
    pause: Duration,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let mut delay = Box::pin(sleep(pause));
    match delay.as_mut().poll(cx) {
        Poll::Ready(()) => Poll::Ready(()),
        Poll::Pending => {
            *slot = Some(delay);
            Poll::Pending
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(delay) = this.read_delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.read_delay = None;
        }

        match this.down.allowance(buf.remaining()) {
            Allowance::Paused => {
                ready!(start_pause(&mut this.read_delay, READ_PAUSE, cx));
                // degenerate zero-length pause; report pending and let the
                // waker fire
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Allowance::Granted(n) if n >= buf.remaining() => {
                let before = buf.filled().len();
                ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
                this.down.consume(buf.filled().len() - before);
                Poll::Ready(Ok(()))
            }
            Allowance::Granted(n) => {
                let filled = {
                    let mut limited = buf.take(n);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                    limited.filled().len()
                };
                // the inner read initialized these bytes in place
                unsafe { buf.assume_init(filled) };
                buf.advance(filled);
                this.down.consume(filled);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(delay) = this.write_delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.write_delay = None;
        }

        match this.up.allowance(data.len()) {
            Allowance::Paused => {
                ready!(start_pause(&mut this.write_delay, WRITE_PAUSE, cx));
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Allowance::Granted(n) => {
                let n = n.min(data.len());
                let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &data[..n]))?;
                this.up.consume(written);
                Poll::Ready(Ok(written))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_grant_within_budget() {
        let limiter = RateLimiter::new(Limit::BytesPerSec(10));
        assert_eq!(limiter.allowance(100), Allowance::Granted(10));
        assert_eq!(limiter.allowance(4), Allowance::Granted(4));

        limiter.consume(10);
        assert_eq!(limiter.allowance(1), Allowance::Paused);
    }

    #[test]
    fn should_pause_when_limit_is_zero() {
        let limiter = RateLimiter::new(Limit::BytesPerSec(0));
        assert_eq!(limiter.allowance(1), Allowance::Paused);

        limiter.set_limit(Limit::Unlimited);
        assert_eq!(limiter.allowance(usize::MAX), Allowance::Granted(usize::MAX));
    }

    #[test]
    fn should_clamp_budget_when_limit_shrinks() {
        let limiter = RateLimiter::new(Limit::BytesPerSec(1000));
        limiter.set_limit(Limit::BytesPerSec(8));
        assert_eq!(limiter.allowance(100), Allowance::Granted(8));
    }
}
