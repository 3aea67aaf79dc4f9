//! KubeRDE Agent Daemon
//!
//! Runs beside a workload and keeps a tunnel to the broker open, relaying
//! every stream the broker opens to the workload's local service.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rde_agent::Agent;
use rde_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "rde-agent")]
#[command(about = "KubeRDE agent - connects a workload to the broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RDE_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URL (overrides config)
    #[arg(long, env = "SERVER_URL")]
    server_url: Option<String>,

    /// Agent identifier, `user-{owner}-{name}` (overrides config)
    #[arg(long, env = "AGENT_ID")]
    agent_id: Option<String>,

    /// Local service streams are relayed to (overrides config)
    #[arg(long, env = "LOCAL_TARGET")]
    local_target: Option<String>,

    /// OAuth2 token endpoint
    #[arg(long, env = "AUTH_TOKEN_URL")]
    auth_token_url: Option<String>,

    /// OAuth2 client id
    #[arg(long, env = "AUTH_CLIENT_ID")]
    auth_client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "AUTH_CLIENT_SECRET", hide_env_values = true)]
    auth_client_secret: Option<String>,

    /// Run with verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(server_url) = self.server_url {
            config.server_url = server_url;
        }
        if let Some(agent_id) = self.agent_id {
            config.agent_id = agent_id;
        }
        if let Some(local_target) = self.local_target {
            config.local_target = local_target;
        }
        if let Some(token_url) = self.auth_token_url {
            config.auth.token_url = token_url;
        }
        if let Some(client_id) = self.auth_client_id {
            config.auth.client_id = client_id;
        }
        if let Some(client_secret) = self.auth_client_secret {
            config.auth.client_secret = client_secret;
        }
    }
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

    tracing::info!("KubeRDE agent starting...");

    let mut config: AgentConfig = config::load_or_default(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    args.apply(&mut config);
    config.validate().context("Invalid agent configuration")?;

    tracing::info!(
        agent_id = %config.agent_id,
        server_url = %config.server_url,
        local_target = %config.local_target,
        "Configuration loaded"
    );

    let agent = Agent::new(&config)?;

    let cancel = CancellationToken::new();
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let cancel_clone = cancel.clone();
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

        cancel_clone.cancel();
    });

    agent.run(cancel).await;

    tracing::info!("Agent shutdown complete");
    Ok(())
}
