//! Socket construction for the datagram and stream transports

pub mod udp;

pub use udp::{create_client_socket, create_socket};

use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::error::NetworkError;

/// Bind a stream listener, mapping failure to a bind error
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    TcpListener::bind(addr).await.map_err(|e| NetworkError::BindFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `host:port`, resolving names if needed
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::ConnectionFailed(format!("resolving {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| NetworkError::ConnectionFailed(format!("no address for {}:{}", host, port)))
}
