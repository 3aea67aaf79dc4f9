//! rde-cli: Command-line client for KubeRDE
//!
//! Provides the `rde` binary: `rde connect` relays stdin/stdout to an
//! agent through the broker (usable as an SSH `ProxyCommand`), and
//! `rde status` prints the broker's view of an agent.

pub mod client;
pub mod commands;
pub mod error;
pub mod output;
pub mod token;

pub use error::CliError;
