//! Configuration management for KubeRDE
//!
//! Every binary reads a TOML file whose sections all fall back to defaults,
//! so an empty file (or none at all) yields a working local setup.

mod agent;
mod broker;
mod controller;
mod mux;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use broker::{AuthConfig, BrokerConfig};
pub use controller::{ControllerConfig, LeaderConfig, QueueConfig};
pub use mux::MuxSettings;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kuberde")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load `path` if given, otherwise defaults
pub fn load_or_default<T>(path: Option<&Path>) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match path {
        Some(path) => load_config(path),
        None => Ok(T::default()),
    }
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// OAuth2 client registered with the identity provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthClientConfig {
    /// Token endpoint (`.../protocol/openid-connect/token`)
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OAuthClientConfig {
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.token_url.is_empty() {
            return Err(ConfigError::MissingField(format!("{}.token_url", section)));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingField(format!("{}.client_id", section)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file() {
        let result = load_config::<BrokerConfig>(Path::new("/nonexistent/kuberde.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config: AgentConfig = load_or_default(None).unwrap();
        assert_eq!(config.local_target, "localhost:80");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("broker.toml");

        let mut config = BrokerConfig::default();
        config.bind_address = "127.0.0.1:9999".into();
        save_config(&path, &config).unwrap();

        let loaded: BrokerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.bind_address, "127.0.0.1:9999");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_address = [").unwrap();
        let result = load_config::<BrokerConfig>(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
