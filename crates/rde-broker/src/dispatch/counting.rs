//! Byte accounting for streams into an agent

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::activity::ActivityRecord;

/// Wraps a stream to an agent, feeding every chunk into its activity record
///
/// Counts as an open stream from construction until drop.
pub struct CountingIo<T> {
    inner: T,
    record: Arc<ActivityRecord>,
}

impl<T> CountingIo<T> {
    pub fn new(inner: T, record: Arc<ActivityRecord>) -> Self {
        record.stream_opened();
        Self { inner, record }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T> Drop for CountingIo<T> {
    fn drop(&mut self) {
        self.record.stream_closed();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CountingIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read = buf.filled().len() - before;
        if read > 0 {
            self.record.record_received(read as u64);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CountingIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            if *written > 0 {
                self.record.record_sent(*written as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityTracker;
    use rde_core::AgentId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counts_both_directions_and_open_streams() {
        let tracker = ActivityTracker::new();
        let id = AgentId::parse("user-alice-dev").unwrap();
        let record = tracker.record(&id);

        let (near, mut far) = tokio::io::duplex(1024);
        let mut counted = CountingIo::new(near, record.clone());
        assert_eq!(record.open_streams(), 1);

        counted.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();

        far.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(record.bytes_sent(), 5);
        assert_eq!(record.bytes_received(), 3);

        drop(counted);
        assert_eq!(record.open_streams(), 0);
    }
}
