//! Server session
//!
//! Owns a listening host while running and the registry of connected
//! peers. The host is created by `start` and destroyed by `stop`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::NetworkError;
use crate::message::Message;
use crate::network::udp::bind_addr;
use crate::network::{Host, HostConfig, HostEvent, NetworkContext, PeerId};
use crate::protocol::DeliveryType;
use crate::session::disconnect::disconnect_peers;
use crate::session::registry::PeerRegistry;

/// Session accepting many clients
pub struct ServerSession {
    host: Option<Host>,
    registry: PeerRegistry,
    config: AppConfig,
    _context: NetworkContext,
}

impl ServerSession {
    pub fn new(context: &NetworkContext, config: &AppConfig) -> Self {
        Self {
            host: None,
            registry: PeerRegistry::new(),
            config: config.clone(),
            _context: context.clone(),
        }
    }

    /// Bind and start accepting connections on `port` (0 picks a free port)
    pub fn start(&mut self, port: u16) -> Result<(), NetworkError> {
        if self.host.is_some() {
            return Ok(());
        }

        let address = bind_addr(&self.config.network, port)?;
        let host = Host::new(&HostConfig::server(address, &self.config.network), &self.config.network)?;

        tracing::info!(
            "Server listening on {} ({} slots)",
            host.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            host.peer_limit()
        );
        self.host = Some(host);
        Ok(())
    }

    /// Disconnect every client and release the host
    ///
    /// Returns [`NetworkError::ForcedDisconnect`] if any client had to be
    /// reset; the server is stopped either way.
    pub fn stop(&mut self) -> Result<(), NetworkError> {
        let Some(mut host) = self.host.take() else {
            return Ok(());
        };

        let targets: Vec<PeerId> = self.registry.ids();
        tracing::info!("Stopping server with {} client(s)", targets.len());

        let outcome = disconnect_peers(&mut host, targets, self.config.session.timeout());
        self.registry.clear();
        drop(host);

        tracing::info!("Server stopped");
        outcome.into_result()
    }

    pub fn is_running(&self) -> bool {
        self.host.is_some()
    }

    /// Clients the host reports connected
    pub fn num_clients(&self) -> usize {
        self.host.as_ref().map_or(0, Host::connected_peers)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.host
            .as_ref()
            .ok_or(NetworkError::NotInitialized)?
            .local_addr()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Send to one registered client and flush; unknown ids are dropped
    pub fn send(&mut self, peer_id: PeerId, delivery: DeliveryType, payload: &[u8]) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        if !self.registry.contains(peer_id) {
            tracing::debug!("Dropping send to unregistered peer {}", peer_id);
            return;
        }

        if let Err(e) = host.send(peer_id, delivery.channel(), delivery.flags(), payload) {
            tracing::debug!("Dropping send to peer {}: {}", peer_id, e);
            return;
        }
        if let Err(e) = host.flush() {
            tracing::warn!("Flush failed: {}", e);
        }
    }

    /// Send to every connected client and flush; skipped with no clients
    pub fn broadcast(&mut self, delivery: DeliveryType, payload: &[u8]) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        if host.connected_peers() == 0 {
            return;
        }

        if let Err(e) = host.broadcast(delivery.channel(), delivery.flags(), payload) {
            tracing::debug!("Dropping broadcast: {}", e);
            return;
        }
        if let Err(e) = host.flush() {
            tracing::warn!("Flush failed: {}", e);
        }
    }

    /// Drain every queued event without waiting, keeping the registry in
    /// step with the host
    pub fn poll(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        let Some(host) = self.host.as_mut() else {
            return messages;
        };

        let max_len = self.config.session.max_message_len;
        loop {
            match host.service(Duration::ZERO) {
                Ok(Some(HostEvent::Connect { peer })) => {
                    let address = host.peer_address(peer);
                    tracing::info!(
                        "Client {} connected from {}",
                        peer,
                        address.map(|a| a.to_string()).unwrap_or_default()
                    );
                    self.registry.insert(peer, address);
                    messages.push(Message::connect(peer));
                }
                Ok(Some(HostEvent::Disconnect { peer })) => {
                    tracing::info!("Client {} disconnected", peer);
                    self.registry.remove(peer);
                    messages.push(Message::disconnect(peer));
                }
                Ok(Some(HostEvent::Receive { peer, payload, .. })) => {
                    messages.push(Message::data(peer, payload, max_len));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Poll aborted: {}", e);
                    break;
                }
            }
        }

        messages
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Stop on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHANNEL_COUNT;
    use crate::message::MessageKind;
    use crate::network::initialize;
    use crate::protocol::Packet;
    use std::thread;
    use std::time::Instant;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.session.timeout_ms = 200;
        config
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let context = initialize();
        let mut server = ServerSession::new(&context, &test_config());
        assert!(!server.is_running());
        assert!(server.stop().is_ok());

        server.start(0).unwrap();
        assert!(server.is_running());
        let addr = server.local_addr().unwrap();

        // Redundant start keeps the existing host
        server.start(0).unwrap();
        assert_eq!(server.local_addr().unwrap(), addr);

        assert_eq!(server.num_clients(), 0);
        assert!(server.poll().is_empty());
        assert!(server.stop().is_ok());
        assert!(!server.is_running());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_idle_server_ignores_sends() {
        let context = initialize();
        let mut server = ServerSession::new(&context, &test_config());

        server.broadcast(DeliveryType::Reliable, b"0-1,1");
        server.send(3, DeliveryType::Unreliable, b"0-1,1");
        assert!(server.poll().is_empty());

        server.start(0).unwrap();
        server.broadcast(DeliveryType::Reliable, b"0-1,1");
        server.send(3, DeliveryType::Unreliable, b"0-1,1");
        assert_eq!(server.num_clients(), 0);
    }

    #[test]
    fn test_half_open_connect_is_never_reported() {
        let context = initialize();
        let mut config = test_config();
        config.network.peer_timeout_ms = 200;
        let mut server = ServerSession::new(&context, &config);
        server.start(0).unwrap();

        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let connect = Packet::connect(0, CHANNEL_COUNT, 4242).serialize();
        raw.send_to(&connect, server.local_addr().unwrap()).unwrap();

        let mut envelopes = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(600);
        while Instant::now() < deadline {
            envelopes.extend(server.poll());
            thread::sleep(Duration::from_millis(2));
        }

        assert!(envelopes.is_empty());
        assert_eq!(server.num_clients(), 0);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_poll_keeps_envelopes_collected_before_transport_error() {
        let context = initialize();
        let config = test_config();
        let mut server = ServerSession::new(&context, &config);
        server.start(0).unwrap();

        let mut client = Host::new(&HostConfig::client(&config.network), &config.network).unwrap();
        let peer = client
            .connect(server.local_addr().unwrap(), CHANNEL_COUNT)
            .unwrap();

        let mut joined = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        while joined.is_empty() && Instant::now() < deadline {
            while client.service(Duration::ZERO).unwrap().is_some() {}
            joined.extend(server.poll());
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(joined.iter().map(Message::kind).collect::<Vec<_>>(), vec![MessageKind::Connect]);

        let delivery = DeliveryType::Reliable;
        for position in [b"1-0,0", b"1-0,1", b"1-0,2"] {
            client
                .send(peer, delivery.channel(), delivery.flags(), position)
                .unwrap();
        }
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(20));

        // One successful read, then the socket fails mid-drain.
        if let Some(host) = server.host.as_mut() {
            host.fail_receive_after(1);
        }
        let messages = server.poll();
        let texts: Vec<String> = messages.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["1-0,0", "1-0,1", "1-0,2"]);

        // The session carries on after the aborted drain.
        assert!(server.is_running());
        assert_eq!(server.num_clients(), 1);
        assert!(server.poll().is_empty());
    }

    #[test]
    fn test_port_in_use_fails() {
        let context = initialize();
        let mut first = ServerSession::new(&context, &test_config());
        first.start(0).unwrap();
        let port = first.local_addr().unwrap().port();

        let mut second = ServerSession::new(&context, &test_config());
        assert!(matches!(second.start(port), Err(NetworkError::BindFailed(_))));
        assert!(!second.is_running());
    }
}
