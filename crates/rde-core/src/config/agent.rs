//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::{MuxSettings, OAuthClientConfig};
use crate::error::ConfigError;

/// Configuration for the workload agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker base URL (`ws://`, `wss://`, `http://` or `https://`)
    pub server_url: String,

    /// This agent's identifier (`user-{owner}-{name}`)
    pub agent_id: String,

    /// Address of the workload service streams are relayed to
    pub local_target: String,

    /// Client credentials used to authenticate to the broker
    pub auth: OAuthClientConfig,

    /// Reconnection backoff
    pub backoff: BackoffConfig,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How long to keep retrying the local target while the workload starts
    #[serde(with = "duration_secs")]
    pub local_dial_timeout: Duration,

    #[serde(with = "duration_millis")]
    pub local_dial_retry: Duration,

    /// Interval between activity heartbeats to the broker
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    pub mux: MuxSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            agent_id: String::new(),
            local_target: "localhost:80".to_string(),
            auth: OAuthClientConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(30),
            local_dial_timeout: Duration::from_secs(60),
            local_dial_retry: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(60),
            mux: MuxSettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.is_empty() {
            return Err(ConfigError::MissingField("agent_id".into()));
        }
        crate::types::AgentId::parse(&self.agent_id)
            .map_err(|e| ConfigError::Invalid(format!("agent_id: {}", e)))?;
        if self.local_target.is_empty() {
            return Err(ConfigError::MissingField("local_target".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be > 0".into()));
        }
        self.auth.validate("auth")?;
        self.mux.validate()
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
