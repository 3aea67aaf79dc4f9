//! Fleet controller configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::OAuthClientConfig;
use crate::error::ConfigError;

/// Configuration for the fleet controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Namespace to watch; None watches all namespaces
    pub namespace: Option<String>,

    /// Concurrent reconcile workers
    pub workers: usize,

    /// Base period of the per-agent idle sweep
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Fraction of `sweep_interval` each sweep is randomly shifted by
    pub sweep_jitter: f64,

    /// Broker base URL for the management API
    pub broker_url: String,

    /// Credentials for the management API
    pub broker_auth: Option<OAuthClientConfig>,

    /// Token endpoint injected into agent workloads as `AUTH_TOKEN_URL`
    pub agent_token_url: String,

    /// Image of the agent sidecar in every workload
    pub agent_image: String,

    /// Liveness/readiness listener
    pub health_address: String,

    pub leader: LeaderConfig,

    pub queue: QueueConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 4,
            sweep_interval: Duration::from_secs(30),
            sweep_jitter: 0.2,
            broker_url: "http://kuberde-server:8080".to_string(),
            broker_auth: None,
            agent_token_url: String::new(),
            agent_image: "kuberde/agent:latest".to_string(),
            health_address: "0.0.0.0:8081".to_string(),
            leader: LeaderConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be > 0".into()));
        }
        if self.agent_image.is_empty() {
            return Err(ConfigError::MissingField("agent_image".into()));
        }
        if !(0.0..1.0).contains(&self.sweep_jitter) {
            return Err(ConfigError::Invalid("sweep_jitter must be in [0, 1)".into()));
        }
        if let Some(auth) = &self.broker_auth {
            auth.validate("broker_auth")?;
        }
        self.leader.validate()?;
        self.queue.validate()
    }
}

/// `[leader]` section: Lease-based leader election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Disable to run a single replica without a Lease
    pub enabled: bool,

    pub lease_name: String,

    /// Namespace holding the Lease; defaults to `namespace` or `default`
    pub lease_namespace: Option<String>,

    /// Holder identity; defaults to the hostname (the pod name)
    pub identity: Option<String>,

    /// A lease not renewed for this long may be taken over
    #[serde(with = "duration_secs")]
    pub lease_duration: Duration,

    /// Interval between acquire/renew attempts
    #[serde(with = "duration_secs")]
    pub retry_period: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: "kuberde-controller".to_string(),
            lease_namespace: None,
            identity: None,
            lease_duration: Duration::from_secs(15),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_period.is_zero() || self.retry_period >= self.lease_duration {
            return Err(ConfigError::Invalid(
                "leader.retry_period must be > 0 and shorter than leader.lease_duration".into(),
            ));
        }
        Ok(())
    }

    /// Holder identity, falling back to the hostname
    pub fn holder_identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

/// `[queue]` section: work queue rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// First retry delay for a failing item
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Cap on per-item retry delay
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Sustained rate of rate-limited requeues across all items
    pub qps: f64,

    /// Requeues allowed in a burst
    pub burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(300),
            qps: 10.0,
            burst: 100,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qps <= 0.0 || self.burst == 0 {
            return Err(ConfigError::Invalid("queue.qps and queue.burst must be > 0".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid("queue.base_delay exceeds queue.max_delay".into()));
        }
        Ok(())
    }
}
