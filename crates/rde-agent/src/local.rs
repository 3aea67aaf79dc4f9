//! Relaying broker streams to the local workload

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use rde_core::config::AgentConfig;

/// The workload service streams are relayed to
#[derive(Debug, Clone)]
pub struct LocalTarget {
    address: String,
    /// Keep retrying a refused dial this long; the workload may still be booting
    dial_timeout: Duration,
    retry_interval: Duration,
}

impl LocalTarget {
    pub fn new(address: impl Into<String>, dial_timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            address: address.into(),
            dial_timeout,
            retry_interval,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.local_target.clone(),
            config.local_dial_timeout,
            config.local_dial_retry,
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect, retrying until `dial_timeout` has passed
    pub async fn dial(&self) -> io::Result<TcpStream> {
        let deadline = Instant::now() + self.dial_timeout;
        loop {
            let error = match tokio::time::timeout_at(deadline, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} did not accept within {:?}", self.address, self.dial_timeout),
                    ))
                }
            };

            if Instant::now() + self.retry_interval >= deadline {
                return Err(error);
            }
            debug!(target = %self.address, "Local dial failed, retrying: {}", error);
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Relay `stream` to a fresh connection to the target until both sides close
    pub async fn serve<S>(&self, mut stream: S) -> io::Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut local = self.dial().await?;
        tokio::io::copy_bidirectional(&mut stream, &mut local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_serve_relays_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let target = LocalTarget::new(addr.to_string(), Duration::from_secs(5), Duration::from_millis(50));
        let (stream, mut peer) = tokio::io::duplex(1024);
        let relay = tokio::spawn(async move { target.serve(stream).await });

        peer.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        peer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(peer);
        let (to_local, from_local) = relay.await.unwrap().unwrap();
        assert_eq!((to_local, from_local), (5, 5));
    }

    #[tokio::test]
    async fn test_dial_waits_for_target_to_start() {
        // Reserve a port, release it, and only listen on it after a while
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            listener.accept().await.unwrap();
        });

        let target = LocalTarget::new(addr.to_string(), Duration::from_secs(10), Duration::from_millis(50));
        target.dial().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_gives_up() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let target = LocalTarget::new(addr.to_string(), Duration::from_millis(200), Duration::from_millis(50));
        assert!(target.dial().await.is_err());
    }
}
