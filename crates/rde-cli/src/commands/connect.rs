//! Connect command implementation
//!
//! Relays stdin/stdout over the broker's interactive endpoint, so
//! `rde connect` works as an SSH `ProxyCommand`:
//!
//! ```text
//! Host *.rde
//!     ProxyCommand rde connect %h
//! ```

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use rde_core::AgentId;

use crate::client::{dial_interactive, Server};
use crate::error::CliError;
use crate::output::print_error;

const BUFFER_SIZE: usize = 32 * 1024;

/// Dial `agent_id` and relay the process's stdio until either side closes
pub async fn connect_command(
    server: &Server,
    token: &str,
    agent_id: &AgentId,
    wait: Duration,
) -> Result<()> {
    let socket = match dial_interactive(server, token, agent_id, wait).await {
        Ok(socket) => socket,
        Err(e) => {
            print_error(&format!("Failed to connect to {}: {}", agent_id, e));
            if matches!(e, CliError::Rejected { status: 401, .. }) {
                print_error("Your token was rejected; log in again to refresh it");
            }
            return Err(e.into());
        }
    };

    relay(socket, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

/// Copy `input` to the socket as binary messages and the socket to `output`
///
/// End of input sends a Close and keeps draining the socket; the relay
/// finishes when the broker closes its side.
pub async fn relay<S, R, W>(socket: WebSocketStream<S>, mut input: R, mut output: W) -> Result<(), CliError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    let upload = async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
                .await?;
        }
        sink.send(Message::Close(None)).await?;
        Ok::<_, CliError>(())
    };

    let download = async move {
        let mut received: u64 = 0;
        while let Some(message) = stream.next().await {
            match message? {
                Message::Binary(data) => {
                    output.write_all(&data).await?;
                    received += data.len() as u64;
                }
                Message::Text(text) => {
                    output.write_all(text.as_bytes()).await?;
                    received += text.len() as u64;
                }
                Message::Close(_) => break,
                _ => continue,
            }
            output.flush().await?;
        }
        output.flush().await?;
        Ok::<_, CliError>(received)
    };

    tokio::pin!(upload, download);
    let mut uploading = true;
    loop {
        tokio::select! {
            result = &mut upload, if uploading => {
                uploading = false;
                if let Err(e) = result {
                    tracing::debug!("Upload stopped: {}", e);
                }
            }
            result = &mut download => {
                let received = result?;
                tracing::debug!(received, "Relay finished");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_once(listener: &TcpListener) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_binary() {
                ws.send(message).await.unwrap();
            }
        }
    }

    /// Answer one plain HTTP request with 503 and `Retry-After: 1`
    async fn unavailable_once(listener: &TcpListener) {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = tcp.read(&mut buf).await.unwrap();
            assert!(n > 0);
            request.extend_from_slice(&buf[..n]);
        }
        tcp.write_all(
            b"HTTP/1.1 503 Service Unavailable\r\nRetry-After: 1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_relay_round_trip_and_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { echo_once(&listener).await });

        let tcp = TcpStream::connect(address).await.unwrap();
        let (socket, _) = tokio_tungstenite::client_async(
            format!("ws://{}/ssh/user-alice-dev", address),
            tcp,
        )
        .await
        .unwrap();

        let (output, mut received) = tokio::io::duplex(BUFFER_SIZE);
        let input: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";
        tokio::time::timeout(Duration::from_secs(5), relay(socket, input, output))
            .await
            .expect("relay did not finish after input closed")
            .unwrap();

        let mut echoed = Vec::new();
        received.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"SSH-2.0-OpenSSH_9.6\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_waits_for_waking_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            unavailable_once(&listener).await;
            echo_once(&listener).await;
        });

        let agent = AgentId::parse("user-alice-dev").unwrap();
        let broker = Server::parse(&format!("http://{}", address)).unwrap();
        let started = std::time::Instant::now();
        let socket = dial_interactive(&broker, "token", &agent, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));

        let (output, _received) = tokio::io::duplex(BUFFER_SIZE);
        relay(socket, tokio::io::empty(), output).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_gives_up_after_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { unavailable_once(&listener).await });

        let agent = AgentId::parse("user-alice-dev").unwrap();
        let broker = Server::parse(&format!("http://{}", address)).unwrap();
        let result = dial_interactive(&broker, "token", &agent, Duration::ZERO).await;
        assert!(matches!(result, Err(CliError::StillUnavailable { .. })));
        server.await.unwrap();
    }
}
