//! Duplex relay plumbing
//!
//! Activity-tracking stream wrapper for idle timeout detection, the single
//! writer that drains a connection's outbound channel, and the idle watchdog.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::hooks::Peer;
use super::pipeline::Outbound;

/// Last-activity clock shared by both directions of a connection
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    start_time: Instant,
    /// Seconds since `start_time` at the last read
    last_activity: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_activity: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(self.start_time.elapsed().as_secs(), Ordering::Release);
    }

    /// Seconds since the last recorded activity
    pub fn idle_secs(&self) -> u64 {
        let last_active = self.last_activity.load(Ordering::Acquire);
        self.start_time.elapsed().as_secs().saturating_sub(last_active)
    }

    /// Resolve once no activity was seen for `timeout`, returning the idle time
    pub async fn idle_timeout(&self, timeout: Duration) -> u64 {
        let check_every = (timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(30));
        let mut interval = tokio::time::interval(check_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let idle_secs = self.idle_secs();
            if idle_secs >= timeout.as_secs() {
                return idle_secs;
            }
        }
    }
}

pin_project! {
    /// A read stream wrapper that tracks the last activity time and bytes read
    pub struct TimedStream<S> {
        #[pin]
        inner: S,
        activity: ActivityTracker,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, activity: ActivityTracker) -> Self {
        Self {
            inner,
            activity,
            read_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of bytes read through this wrapper
    pub fn read_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.read_bytes)
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.activity.touch();
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Bytes written to each peer by `write_outbound`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub to_client: u64,
    pub to_server: u64,
}

/// Drain `rx` into the two write halves until every sender is gone.
///
/// Items are written in channel order, so per-direction FIFO order is kept.
/// Both halves are shut down once the channel closes.
pub async fn write_outbound<C, S>(
    mut rx: mpsc::Receiver<Outbound>,
    mut client: C,
    mut server: S,
) -> std::io::Result<WriteResult>
where
    C: AsyncWrite + Unpin,
    S: AsyncWrite + Unpin,
{
    let mut result = WriteResult::default();
    while let Some(item) = rx.recv().await {
        match item.peer {
            Peer::Client => {
                client.write_all(&item.bytes).await?;
                result.to_client += item.bytes.len() as u64;
            }
            Peer::Server => {
                server.write_all(&item.bytes).await?;
                result.to_server += item.bytes.len() as u64;
            }
        }
    }
    let _ = client.shutdown().await;
    let _ = server.shutdown().await;
    Ok(result)
}
