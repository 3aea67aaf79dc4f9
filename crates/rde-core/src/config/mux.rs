//! Multiplexing parameters shared by broker and agent configuration

use rde_protocol::MuxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// `[mux]` section. Must match on both ends of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxSettings {
    /// Concurrent stream opens queued before new ones are refused
    pub accept_backlog: usize,

    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    #[serde(with = "duration_secs")]
    pub keepalive_timeout: Duration,

    /// Per-write bound, sized for large transfers over slow links
    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Per-stream receive window in bytes
    pub initial_window: u32,

    pub max_frame_payload: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        let defaults = MuxConfig::default();
        Self {
            accept_backlog: defaults.accept_backlog,
            keepalive_interval: defaults.keepalive_interval,
            keepalive_timeout: defaults.keepalive_timeout,
            write_timeout: defaults.write_timeout,
            initial_window: defaults.initial_window,
            max_frame_payload: defaults.max_frame_payload,
        }
    }
}

impl MuxSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_backlog == 0 {
            return Err(ConfigError::Invalid("mux.accept_backlog must be > 0".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid("mux.keepalive_interval must be > 0".into()));
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(ConfigError::Invalid(
                "mux.keepalive_timeout must exceed mux.keepalive_interval".into(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("mux.write_timeout must be > 0".into()));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > self.initial_window as usize {
            return Err(ConfigError::Invalid(
                "mux.max_frame_payload must be between 1 and mux.initial_window".into(),
            ));
        }
        Ok(())
    }

    pub fn to_mux_config(&self) -> MuxConfig {
        MuxConfig {
            accept_backlog: self.accept_backlog,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            write_timeout: self.write_timeout,
            initial_window: self.initial_window,
            max_frame_payload: self.max_frame_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_defaults() {
        let settings = MuxSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.to_mux_config(), MuxConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let settings: MuxSettings = toml::from_str("keepalive_interval = 10\nkeepalive_timeout = 25").unwrap();
        assert_eq!(settings.keepalive_interval, Duration::from_secs(10));
        assert_eq!(settings.write_timeout, Duration::from_secs(120));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_keepalive() {
        let settings = MuxSettings {
            keepalive_timeout: Duration::from_secs(10),
            ..MuxSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
