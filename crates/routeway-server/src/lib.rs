//! Inbound side of the routeway data-plane
//!
//! [`ProxyServer`] accepts HTTP/1.x connections and hands every request to
//! the [`RequestHandler`] pipeline. The admin API (axum) feeds registrations
//! into the shared registry and exposes introspection endpoints.

pub mod access_log;
pub mod admin;
pub mod handler;
pub mod health;
pub mod hijack;
pub mod server;

pub use admin::{admin_router, AdminServer, AdminState};
pub use handler::RequestHandler;
pub use health::HeartbeatFlag;
pub use hijack::UpgradeHijacker;
pub use server::ProxyServer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}

impl ServerError {
    pub(crate) fn bind(addr: std::net::SocketAddr, error: std::io::Error) -> Self {
        Self::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: error.to_string(),
        }
    }
}
