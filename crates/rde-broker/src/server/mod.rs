//! HTTP/WebSocket front end

mod agent;
mod listener;
pub mod routes;
mod user;
pub mod ws;

pub use listener::BrokerServer;
pub use routes::router;
