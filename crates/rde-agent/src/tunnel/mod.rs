//! Tunnel management for connecting to the broker

mod connector;
mod reconnect;

pub use connector::{connect_url, ActiveTunnel, ConnectionError, TunnelConnector};
pub use reconnect::ExponentialBackoff;
