//! Broker configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::MuxSettings;
use crate::error::ConfigError;

/// Configuration for the tunnel broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_address: String,

    /// Base domain for subdomain HTTP proxying (`{agent_id}.{agent_domain}`)
    pub agent_domain: Option<String>,

    /// Time allowed for a client to send complete request headers
    #[serde(with = "duration_secs")]
    pub header_read_timeout: Duration,

    /// Maximum size of request headers
    pub max_header_bytes: usize,

    /// How long a user request waits for an offline agent to reconnect (0 disables)
    #[serde(with = "duration_secs")]
    pub session_wait: Duration,

    /// Bound on opening a stream inside an agent session
    #[serde(with = "duration_secs")]
    pub stream_open_timeout: Duration,

    /// A relayed stream idle in both directions for this long is closed (0 disables)
    #[serde(with = "duration_secs")]
    pub stream_idle_timeout: Duration,

    /// Grace period for open streams when sessions drain at shutdown
    #[serde(with = "duration_secs")]
    pub drain_grace: Duration,

    /// Token verification
    pub auth: AuthConfig,

    /// Multiplexing parameters
    pub mux: MuxSettings,

    /// Admitted agents and their owners. Empty means the identifier's owner
    /// segment is authoritative.
    pub owners: HashMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            agent_domain: None,
            header_read_timeout: Duration::from_secs(30),
            max_header_bytes: 1024 * 1024,
            session_wait: Duration::from_secs(15),
            stream_open_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(3600),
            drain_grace: Duration::from_secs(10),
            auth: AuthConfig::default(),
            mux: MuxSettings::default(),
            owners: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwks_url.is_empty() {
            return Err(ConfigError::MissingField("auth.jwks_url".into()));
        }
        if self.auth.algorithms.is_empty() {
            return Err(ConfigError::Invalid("auth.algorithms must not be empty".into()));
        }
        // hyper refuses header buffers smaller than this
        if self.max_header_bytes < 8192 {
            return Err(ConfigError::Invalid("max_header_bytes must be at least 8192".into()));
        }
        if self.stream_open_timeout.is_zero() {
            return Err(ConfigError::Invalid("stream_open_timeout must be > 0".into()));
        }
        self.mux.validate()
    }

    /// Idle timeout for relayed streams, None when disabled
    pub fn stream_idle(&self) -> Option<Duration> {
        (!self.stream_idle_timeout.is_zero()).then_some(self.stream_idle_timeout)
    }
}

/// `[auth]` section: how bearer tokens are verified
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWKS endpoint of the identity provider
    pub jwks_url: String,

    /// Expected `iss`, if any
    pub issuer: Option<String>,

    /// Expected `aud`, if any
    pub audience: Option<String>,

    /// Accepted signing algorithms (`RS256`, `ES256`, ...)
    pub algorithms: Vec<String>,

    /// Clock skew tolerated on `exp`
    #[serde(with = "duration_secs")]
    pub leeway: Duration,

    /// Background JWKS refresh period
    #[serde(with = "duration_secs")]
    pub jwks_refresh_interval: Duration,

    /// Client ids allowed to connect agents. Empty accepts any service client.
    pub agent_client_ids: Vec<String>,

    /// Service clients allowed to read the management API for any agent
    pub management_client_ids: Vec<String>,

    /// Cookie checked for a token when no Authorization header is present
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_url: String::new(),
            issuer: None,
            audience: None,
            algorithms: vec!["RS256".to_string()],
            leeway: Duration::from_secs(30),
            jwks_refresh_interval: Duration::from_secs(300),
            agent_client_ids: Vec::new(),
            management_client_ids: Vec::new(),
            cookie_name: "kuberde_session".to_string(),
        }
    }
}
