//! Client session
//!
//! Wraps a single-slot host talking to one implicit remote peer, the
//! server. `connect` and `disconnect` block for at most the configured
//! timeout; everything else returns immediately.

use std::net::SocketAddr;
use std::time::Instant;

use crate::config::AppConfig;
use crate::constants::{CHANNEL_COUNT, SERVER_PEER_ID};
use crate::error::NetworkError;
use crate::message::Message;
use crate::network::{resolve, Host, HostConfig, HostEvent, NetworkContext, PeerId};
use crate::protocol::DeliveryType;
use crate::session::disconnect::disconnect_peers;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Session with a single server
pub struct ClientSession {
    host: Host,
    server: Option<PeerId>,
    state: ConnectionState,
    config: AppConfig,
    _context: NetworkContext,
}

impl ClientSession {
    /// Create the client host; fails if the network layer is not initialized
    pub fn new(context: &NetworkContext, config: &AppConfig) -> Result<Self, NetworkError> {
        let host = Host::new(&HostConfig::client(&config.network), &config.network)?;

        Ok(Self {
            host,
            server: None,
            state: ConnectionState::Disconnected,
            config: config.clone(),
            _context: context.clone(),
        })
    }

    /// Connect to `host:port`, waiting up to the session timeout
    ///
    /// Already being connected is not an error. On failure the session is
    /// left disconnected and may retry.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), NetworkError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        let address = resolve(host, port)?;
        let attempt = self.host.connect(address, CHANNEL_COUNT)?;
        self.state = ConnectionState::Connecting;
        tracing::info!("Connecting to {}", address);

        let timeout = self.config.session.timeout();
        let deadline = Instant::now() + timeout;

        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(NetworkError::ConnectTimeout(timeout));
            }

            match self.host.service(remaining) {
                Ok(Some(HostEvent::Connect { peer })) if peer == attempt => break Ok(()),
                Ok(Some(event)) => {
                    break Err(NetworkError::ConnectFailed(format!(
                        "unexpected {:?} while connecting to {}",
                        event, address
                    )))
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.server = Some(attempt);
                self.state = ConnectionState::Connected;
                tracing::info!(
                    "Connected to {} as peer {}",
                    address,
                    self.peer_id().unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                self.host.reset(attempt);
                self.state = ConnectionState::Disconnected;
                tracing::warn!("Connection to {} failed: {}", address, e);
                Err(e)
            }
        }
    }

    /// Disconnect from the server, waiting up to the session timeout
    ///
    /// Always leaves the session disconnected; returns
    /// [`NetworkError::ForcedDisconnect`] if the server never confirmed.
    pub fn disconnect(&mut self) -> Result<(), NetworkError> {
        let Some(server) = self.server.take() else {
            self.state = ConnectionState::Disconnected;
            return Ok(());
        };

        self.state = ConnectionState::Disconnecting;
        let outcome = disconnect_peers(&mut self.host, [server], self.config.session.timeout());
        self.state = ConnectionState::Disconnected;

        if outcome.is_graceful() {
            tracing::info!("Disconnected from server");
        }
        outcome.into_result()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Id the server assigned to this client
    pub fn peer_id(&self) -> Option<u32> {
        self.server.and_then(|peer| self.host.remote_peer_id(peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.host.local_addr()
    }

    /// Send to the server and flush; dropped when not connected
    pub fn send(&mut self, delivery: DeliveryType, payload: &[u8]) {
        let Some(server) = self.server.filter(|_| self.is_connected()) else {
            tracing::debug!("Not connected, dropping {}-byte send", payload.len());
            return;
        };

        if let Err(e) = self
            .host
            .send(server, delivery.channel(), delivery.flags(), payload)
        {
            tracing::debug!("Dropping send to server: {}", e);
            return;
        }
        if let Err(e) = self.host.flush() {
            tracing::warn!("Flush failed: {}", e);
        }
    }

    /// Drain every queued event without waiting
    ///
    /// Data envelopes are tagged with [`SERVER_PEER_ID`]. A disconnect
    /// envelope means the server went away and the session is now
    /// disconnected.
    pub fn poll(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        if !self.is_connected() {
            return messages;
        }

        let max_len = self.config.session.max_message_len;
        loop {
            match self.host.service(std::time::Duration::ZERO) {
                Ok(Some(HostEvent::Receive { payload, .. })) => {
                    messages.push(Message::data(SERVER_PEER_ID, payload, max_len));
                }
                Ok(Some(HostEvent::Disconnect { peer })) => {
                    if self.server == Some(peer) {
                        tracing::info!("Server disconnected");
                        self.server = None;
                        self.state = ConnectionState::Disconnected;
                        messages.push(Message::disconnect(SERVER_PEER_ID));
                        break;
                    }
                }
                Ok(Some(HostEvent::Connect { peer })) => {
                    tracing::debug!("Ignoring unexpected connect for peer {}", peer);
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

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.server.is_some() {
            if let Err(e) = self.disconnect() {
                tracing::warn!("Disconnect on drop: {}", e);
            }
        }
    }
}
