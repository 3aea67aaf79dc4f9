//! KubeRDE fleet controller
//!
//! Reconciles `RDEAgent` records into agent workloads and scales idle
//! ones to zero.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rde_controller::controller::agent_events;
use rde_controller::health::{self, HealthState};
use rde_controller::leader::{run_while_leading, KubeLeaseStore};
use rde_controller::{
    BrokerActivity, Controller, KubeBackend, LeaderElector, RDEAgent, Reconciler, WorkloadSettings,
};
use rde_core::config::{self, ControllerConfig, OAuthClientConfig};

#[derive(Parser)]
#[command(name = "rde-controller")]
#[command(about = "KubeRDE fleet controller")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RDE_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Broker base URL for activity lookups (overrides config)
    #[arg(long, env = "BROKER_URL")]
    broker_url: Option<String>,

    /// Agent sidecar image (overrides config)
    #[arg(long, env = "KUBERDE_AGENT_IMAGE")]
    agent_image: Option<String>,

    /// Token endpoint injected into agent workloads (overrides config)
    #[arg(long, env = "AGENT_TOKEN_URL")]
    agent_token_url: Option<String>,

    /// Token endpoint for the controller's own broker credentials
    #[arg(long, env = "BROKER_TOKEN_URL")]
    broker_token_url: Option<String>,

    #[arg(long, env = "BROKER_CLIENT_ID")]
    broker_client_id: Option<String>,

    #[arg(long, env = "BROKER_CLIENT_SECRET", hide_env_values = true)]
    broker_client_secret: Option<String>,

    /// Run without leader election (single replica only)
    #[arg(long)]
    no_leader_election: bool,

    /// Print the RDEAgent CustomResourceDefinition as JSON and exit
    #[arg(long)]
    print_crd: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut ControllerConfig) {
        if let Some(namespace) = self.namespace {
            config.namespace = Some(namespace);
        }
        if let Some(broker_url) = self.broker_url {
            config.broker_url = broker_url;
        }
        if let Some(agent_image) = self.agent_image {
            config.agent_image = agent_image;
        }
        if let Some(token_url) = self.agent_token_url {
            config.agent_token_url = token_url;
        }
        if self.broker_token_url.is_some() || self.broker_client_id.is_some() {
            let auth = config.broker_auth.get_or_insert_with(OAuthClientConfig::default);
            if let Some(token_url) = self.broker_token_url {
                auth.token_url = token_url;
            }
            if let Some(client_id) = self.broker_client_id {
                auth.client_id = client_id;
            }
            if let Some(client_secret) = self.broker_client_secret {
                auth.client_secret = client_secret;
            }
        }
        if self.no_leader_election {
            config.leader.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        println!("{}", serde_json::to_string_pretty(&RDEAgent::crd())?);
        return Ok(());
    }

    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("KubeRDE controller starting...");

    let mut config: ControllerConfig = config::load_or_default(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    args.apply(&mut config);
    config.validate().context("Invalid controller configuration")?;

    tracing::info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        broker_url = %config.broker_url,
        workers = config.workers,
        "Configuration loaded"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    // Without election the sender stays here so leadership never changes
    let (leader, elector_task, _fixed_leader) = if config.leader.enabled {
        let namespace = config
            .leader
            .lease_namespace
            .clone()
            .or_else(|| config.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        let store = Arc::new(KubeLeaseStore::new(
            client.clone(),
            &namespace,
            config.leader.lease_name.clone(),
        ));
        let (elector, leader) =
            LeaderElector::new(store, config.leader.holder_identity(), &config.leader);
        (leader, Some(tokio::spawn(elector.run(cancel.clone()))), None)
    } else {
        tracing::warn!("Leader election disabled");
        let (tx, rx) = watch::channel(true);
        (rx, None, Some(tx))
    };

    let synced = Arc::new(AtomicBool::new(false));
    let health_state = HealthState::new(Arc::clone(&synced), leader.clone());
    let health_address = config.health_address.clone();
    let health_cancel = cancel.clone();
    let health_task = tokio::spawn(async move {
        if let Err(e) = health::serve(&health_address, health_state, health_cancel).await {
            tracing::error!("Health server failed: {}", e);
        }
    });

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeBackend::new(client.clone())),
        Arc::new(BrokerActivity::new(&config)?),
        WorkloadSettings {
            agent_image: config.agent_image.clone(),
            token_url: config.agent_token_url.clone(),
        },
    ));

    run_while_leading(leader, cancel.clone(), |term| {
        synced.store(false, Ordering::Release);
        let controller = Controller::new(Arc::clone(&reconciler), &config);
        let events = agent_events(client.clone(), config.namespace.as_deref(), Arc::clone(&synced));
        controller.run(events, term)
    })
    .await;

    cancel.cancel();
    if let Some(task) = elector_task {
        let _ = task.await;
    }
    let _ = health_task.await;

    tracing::info!("Controller shutdown complete");
    Ok(())
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
