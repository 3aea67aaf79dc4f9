//! Bidirectional byte relay between a user connection and an agent stream

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const COPY_BUFFER: usize = 32 * 1024;

/// Timeouts applied to a relay
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Tear down when both directions made no progress for this long
    pub idle_timeout: Option<Duration>,
    /// Bound on each individual write
    pub write_timeout: Duration,
}

/// Bytes moved by a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_agent: u64,
    pub from_agent: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToAgent = 0,
    FromAgent = 1,
}

impl Direction {
    fn other(self) -> Direction {
        match self {
            Direction::ToAgent => Direction::FromAgent,
            Direction::FromAgent => Direction::ToAgent,
        }
    }
}

/// Last-progress clock per direction, in milliseconds since `epoch`
struct Progress {
    epoch: Instant,
    last: [AtomicU64; 2],
}

impl Progress {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn mark(&self, dir: Direction) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last[dir as usize].store(now, Ordering::Relaxed);
    }

    fn last(&self, dir: Direction) -> Instant {
        self.epoch + Duration::from_millis(self.last[dir as usize].load(Ordering::Relaxed))
    }

    fn idle_for(&self, dir: Direction) -> Duration {
        Instant::now().saturating_duration_since(self.last(dir))
    }
}

/// Relay until both directions finish, one fails, or `cancel` fires
///
/// EOF in one direction half-closes the opposite writer and the other
/// direction keeps running. An error in either direction ends both.
pub async fn relay<CR, CW, A>(
    client_read: CR,
    client_write: CW,
    agent: A,
    cancel: &CancellationToken,
    options: &RelayOptions,
) -> io::Result<RelayStats>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    A: AsyncRead + AsyncWrite,
{
    let (agent_read, agent_write) = tokio::io::split(agent);
    let progress = Progress::new();

    let to_agent = copy_direction(client_read, agent_write, &progress, Direction::ToAgent, options);
    let from_agent = copy_direction(agent_read, client_write, &progress, Direction::FromAgent, options);

    tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "agent session closed")),
        result = async { tokio::try_join!(to_agent, from_agent) } => {
            result.map(|(to_agent, from_agent)| RelayStats { to_agent, from_agent })
        }
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    progress: &Progress,
    dir: Direction,
    options: &RelayOptions,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match options.idle_timeout {
            Some(idle) => read_unless_idle(&mut reader, &mut buf, progress, dir, idle).await?,
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            bounded(options.write_timeout, writer.shutdown()).await?;
            return Ok(total);
        }
        bounded(options.write_timeout, writer.write_all(&buf[..n])).await?;
        progress.mark(dir);
        total += n as u64;
    }
}

/// Read, failing with `TimedOut` only once neither direction moved for `idle`
async fn read_unless_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    progress: &Progress,
    dir: Direction,
    idle: Duration,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    loop {
        let latest = progress.last(dir).max(progress.last(dir.other()));
        match tokio::time::timeout_at(latest + idle, reader.read(buf)).await {
            Ok(result) => return result,
            Err(_) => {
                if progress.idle_for(dir) >= idle && progress.idle_for(dir.other()) >= idle {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "stream idle"));
                }
            }
        }
    }
}

async fn bounded<F>(limit: Duration, op: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(idle: Option<Duration>) -> RelayOptions {
        RelayOptions {
            idle_timeout: idle,
            write_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_relays_both_ways_and_half_closes() {
        let (client, client_peer) = tokio::io::duplex(4096);
        let (agent, mut agent_peer) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_peer);
        let cancel = CancellationToken::new();

        let echo = tokio::spawn(async move {
            let mut data = Vec::new();
            agent_peer.read_to_end(&mut data).await.unwrap();
            agent_peer.write_all(&data).await.unwrap();
            agent_peer.shutdown().await.unwrap();
        });

        let user = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(client);
            write.write_all(b"ssh-bytes").await.unwrap();
            write.shutdown().await.unwrap();
            let mut back = Vec::new();
            read.read_to_end(&mut back).await.unwrap();
            back
        });

        let stats = relay(client_read, client_write, agent, &cancel, &options(None))
            .await
            .unwrap();
        assert_eq!(stats, RelayStats { to_agent: 9, from_agent: 9 });
        assert_eq!(user.await.unwrap(), b"ssh-bytes");
        echo.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_way_transfer_is_not_idle() {
        let idle = Duration::from_secs(60);
        let (client, client_peer) = tokio::io::duplex(4096);
        let (agent, mut agent_peer) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_peer);
        let cancel = CancellationToken::new();

        // The user never sends; the agent streams output for five minutes
        let producer = tokio::spawn(async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_secs(30)).await;
                agent_peer.write_all(b"tick").await.unwrap();
            }
            agent_peer
        });
        let drain = tokio::spawn(async move {
            let mut client = client;
            let mut sink = [0u8; 64];
            while client.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let relay_task = tokio::spawn(async move {
            relay(client_read, client_write, agent, &cancel, &options(Some(idle))).await
        });

        let agent_peer = producer.await.unwrap();
        assert!(!relay_task.is_finished());

        // Once the agent goes quiet too, the stream times out
        let err = relay_task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(agent_peer);
        drain.abort();
    }

    #[tokio::test]
    async fn test_cancel_stops_relay() {
        let (_client, client_peer) = tokio::io::duplex(64);
        let (agent, _agent_peer) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_peer);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = relay(client_read, client_write, agent, &cancel, &options(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
