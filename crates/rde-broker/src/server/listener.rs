//! HTTP listener
//!
//! Accepts TCP connections and serves the broker router on each with the
//! header limits from configuration. Upgraded connections (agent sessions,
//! interactive streams) leave hyper's control once switched and are
//! drained through the session registry instead.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::server::routes;
use crate::state::BrokerState;

/// The broker's HTTP/WebSocket server
pub struct BrokerServer {
    state: Arc<BrokerState>,
    router: Router,
    cancel: CancellationToken,
    builder: auto::Builder<TokioExecutor>,
}

impl BrokerServer {
    pub fn new(state: Arc<BrokerState>, cancel: CancellationToken) -> Self {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(state.config.header_read_timeout)
            .max_buf_size(state.config.max_header_bytes);
        Self {
            router: routes::router(state.clone()),
            state,
            cancel,
            builder,
        }
    }

    /// Bind the configured address and serve until cancelled
    pub async fn run(&self) -> Result<()> {
        let addr = &self.state.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Broker listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Broker listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::trace!("New connection from {}", peer_addr);
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let router = self.router.clone();
        let builder = self.builder.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer_addr));
                router.clone().oneshot(request)
            });

            let connection = builder.serve_connection_with_upgrades(TokioIo::new(socket), service);
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = cancel.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };

            if let Err(e) = result {
                tracing::debug!("Connection from {} ended with error: {}", peer_addr, e);
            }
        });
    }
}
