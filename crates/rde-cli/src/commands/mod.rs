//! CLI command implementations

mod connect;
mod status;

pub use connect::{connect_command, relay};
pub use status::status_command;
