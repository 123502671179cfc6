//! Low-level UDP socket handling
//!
//! Sockets are non-blocking; all waiting happens in `Host::service`.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Create a configured, non-blocking UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    socket.bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_socket: UdpSocket = socket.into();
    std_socket.set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

/// Configure socket options
fn configure_socket(socket: &Socket, config: &NetworkConfig) -> Result<(), NetworkError> {
    if config.reuse_addr {
        socket.set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    }

    socket.set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    socket.set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

/// Parse `bind_address:port` from the config
pub fn bind_addr(config: &NetworkConfig, port: u16) -> Result<SocketAddr, NetworkError> {
    format!("{}:{}", config.bind_address, port)
        .parse()
        .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))
}

/// Resolve `host:port`, preferring IPv4 (hosts bind IPv4 wildcards)
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::AddressResolution(format!("{}:{} ({})", host, port, e)))?
        .collect();

    addrs.iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::AddressResolution(format!("{}:{}", host, port)))
}

/// ICMP errors surfaced on UDP sockets; these never mean our socket broke
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Network statistics
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
