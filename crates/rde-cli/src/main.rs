//! KubeRDE CLI
//!
//! Reaches remote development environments through the broker:
//! - `rde connect <agent-id>` relays stdin/stdout (use as an SSH `ProxyCommand`)
//! - `rde status <agent-id>` prints the broker's view of an agent

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rde_cli::client::Server;
use rde_cli::commands;
use rde_cli::output::{print_error, print_info};
use rde_cli::token;
use rde_core::ttl::parse_duration;
use rde_core::AgentId;

#[derive(Parser)]
#[command(name = "rde")]
#[command(author, version, about = "Connect to KubeRDE remote development environments")]
#[command(propagate_version = true)]
struct Cli {
    /// Broker address, e.g. https://rde.example.com
    #[arg(short, long, global = true, env = "RDE_SERVER")]
    server: Option<String>,

    /// Bearer token (default: ~/.kuberde/token or ~/.kuberde/token.json)
    #[arg(long, global = true, env = "RDE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive session with an agent, relaying stdin/stdout
    Connect {
        /// Agent identifier (user-{owner}-{name})
        agent_id: String,
        /// How long to wait for a scaled-down agent to wake up
        #[arg(short, long, default_value = "2m", value_parser = parse_wait)]
        wait: Duration,
    },

    /// Show an agent's connection state and activity
    Status {
        /// Agent identifier (user-{owner}-{name})
        agent_id: String,
    },
}

fn parse_wait(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::debug!("{:?}", e);
            1
        }
    };
    // The stdin reader may still be parked in a blocking read
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let server = match cli.server.as_deref() {
        Some(raw) => Server::parse(raw).inspect_err(|e| print_error(&e.to_string()))?,
        None => {
            print_error("No broker address: pass --server or set RDE_SERVER");
            anyhow::bail!("missing server");
        }
    };
    let token = token::resolve(cli.token).inspect_err(|e| print_error(&e.to_string()))?;

    match cli.command {
        Commands::Connect { agent_id, wait } => {
            let agent_id = parse_agent(&agent_id)?;
            if !cli.quiet {
                print_info(&format!("Connecting to {}...", agent_id));
            }
            commands::connect_command(&server, &token, &agent_id, wait).await
        }
        Commands::Status { agent_id } => {
            let agent_id = parse_agent(&agent_id)?;
            commands::status_command(&server, &token, &agent_id).await
        }
    }
}

fn parse_agent(raw: &str) -> Result<AgentId> {
    AgentId::parse(raw)
        .inspect_err(|e| print_error(&format!("Invalid agent id {:?}: {}", raw, e)))
        .with_context(|| format!("invalid agent id {:?}", raw))
}

/// Logs go to stderr; stdout carries the relayed stream
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
