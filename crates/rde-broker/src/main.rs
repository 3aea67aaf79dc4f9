//! KubeRDE tunnel broker
//!
//! Terminates agent sessions and user connections and splices the two.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rde_broker::auth::JwksCache;
use rde_broker::{BrokerServer, BrokerState};
use rde_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "rde-broker")]
#[command(about = "KubeRDE tunnel broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RDE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long, env = "RDE_BIND")]
    bind: Option<String>,

    /// JWKS endpoint of the identity provider (overrides config)
    #[arg(long, env = "RDE_JWKS_URL")]
    jwks_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("KubeRDE broker starting...");

    let mut config: BrokerConfig = config::load_or_default(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(jwks_url) = args.jwks_url {
        config.auth.jwks_url = jwks_url;
    }
    config.validate().context("Invalid broker configuration")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let jwks = Arc::new(JwksCache::new(config.auth.jwks_url.clone()));
    let refresh = jwks.spawn_refresh(config.auth.jwks_refresh_interval, cancel.clone());

    let drain_grace = config.drain_grace;
    let state = Arc::new(BrokerState::new(config, jwks)?);
    let server = BrokerServer::new(Arc::clone(&state), cancel.clone());

    let result = server.run().await;

    tracing::info!(sessions = state.registry.len(), "Draining agent sessions");
    state.registry.drain_all(drain_grace).await;
    cancel.cancel();
    let _ = refresh.await;

    tracing::info!("Broker shutdown complete");
    result
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
    Ok(())
}
