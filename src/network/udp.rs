//! Datagram socket setup
//!
//! Sockets are built with socket2 so the receive buffer can be enlarged before
//! binding; bursts of 60 KB video fragments overflow the OS default quickly.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Create a non-blocking datagram socket bound to `addr`.
///
/// The receive buffer size is best-effort: the OS may clamp it.
pub fn create_socket(addr: SocketAddr, recv_buffer: usize) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        tracing::warn!("Could not set receive buffer to {} bytes: {}", recv_buffer, e);
    }

    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

/// Bind an ephemeral local socket of the same family as `remote`
pub fn create_client_socket(remote: SocketAddr, recv_buffer: usize) -> Result<UdpSocket, NetworkError> {
    let local: SocketAddr = if remote.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    create_socket(local, recv_buffer)
}
