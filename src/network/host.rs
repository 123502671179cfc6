//! Transport host
//!
//! A [`Host`] owns one UDP socket and a fixed pool of peer slots. It is
//! driven entirely by [`Host::service`]: nothing happens on the wire
//! between calls except what [`Host::flush`] pushes out explicitly.
//!
//! ```text
//!   caller ──send/broadcast──> peer.outgoing ──flush──> socket
//!   socket ──service──> peers (acks, reorder, timers) ──> event queue ──> caller
//! ```

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::constants::CHANNEL_COUNT;
use crate::error::NetworkError;
use crate::network::context::ensure_initialized;
use crate::network::peer::{Accepted, Peer, PeerId, PeerState};
use crate::network::udp::{create_socket, is_transient, NetworkStats};
use crate::protocol::{Command, Packet, PacketFlags, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE};

/// Upper bound on datagrams read per service round
const MAX_DATAGRAMS_PER_ROUND: usize = 256;

/// Event produced by [`Host::service`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A connection completed
    Connect { peer: PeerId },
    /// A connection that was reported by `Connect` ended, or an outgoing
    /// attempt timed out
    Disconnect { peer: PeerId },
    /// A packet arrived
    Receive { peer: PeerId, channel: u8, payload: Bytes },
}

impl HostEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Connect { peer } | Self::Disconnect { peer } | Self::Receive { peer, .. } => *peer,
        }
    }
}

/// Host construction parameters
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Local address, `None` for an ephemeral client socket
    pub address: Option<SocketAddr>,
    /// Number of peer slots
    pub peer_limit: usize,
    /// Channels accepted per connection
    pub channel_limit: u8,
    pub retransmit_timeout: Duration,
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
}

impl HostConfig {
    /// Listening host with `max_clients` slots
    pub fn server(address: SocketAddr, network: &NetworkConfig) -> Self {
        Self {
            address: Some(address),
            peer_limit: network.max_clients,
            ..Self::client(network)
        }
    }

    /// Host allowing a single outgoing connection
    pub fn client(network: &NetworkConfig) -> Self {
        Self {
            address: None,
            peer_limit: 1,
            channel_limit: CHANNEL_COUNT,
            retransmit_timeout: network.retransmit_timeout(),
            ping_interval: network.ping_interval(),
            peer_timeout: network.peer_timeout(),
        }
    }
}

/// Datagram endpoint with a fixed pool of peer slots
pub struct Host {
    socket: UdpSocket,
    peers: Vec<Peer>,
    channel_limit: u8,
    events: VecDeque<HostEvent>,
    recv_buffer: Vec<u8>,
    retransmit_timeout: Duration,
    ping_interval: Duration,
    peer_timeout: Duration,
    stats: NetworkStats,
    /// Receive calls left before an injected failure
    #[cfg(test)]
    receive_failure_in: Option<usize>,
}

impl Host {
    /// Create a host and bind its socket
    pub fn new(config: &HostConfig, network: &NetworkConfig) -> Result<Self, NetworkError> {
        ensure_initialized()?;

        if config.peer_limit == 0 || config.peer_limit >= usize::from(crate::protocol::NO_PEER_ID) {
            return Err(NetworkError::BindFailed(format!(
                "peer limit {} out of range",
                config.peer_limit
            )));
        }

        let address = config
            .address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let socket = create_socket(address, network)?;

        let peers = (0..config.peer_limit as PeerId).map(Peer::new).collect();

        tracing::debug!(
            "Host bound to {} with {} peer slot(s)",
            socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            config.peer_limit
        );

        Ok(Self {
            socket,
            peers,
            channel_limit: config.channel_limit.max(1),
            events: VecDeque::new(),
            recv_buffer: vec![0u8; MAX_DATAGRAM_SIZE * 2],
            retransmit_timeout: config.retransmit_timeout,
            ping_interval: config.ping_interval,
            peer_timeout: config.peer_timeout,
            stats: NetworkStats::default(),
            #[cfg(test)]
            receive_failure_in: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn peer_limit(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Number of peers in an established connection
    pub fn connected_peers(&self) -> usize {
        self.peers.iter().filter(|p| p.state.is_connected()).count()
    }

    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.peer(peer).map(|p| p.state)
    }

    pub fn peer_address(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peer(peer).and_then(|p| p.address)
    }

    /// Slot the remote side assigned to us, once the connection is verified
    pub fn remote_peer_id(&self, peer: PeerId) -> Option<u32> {
        self.peer(peer)
            .filter(|p| p.state.is_connected())
            .map(|p| u32::from(p.remote_id))
    }

    fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer as usize)
    }

    fn peer_mut(&mut self, peer: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer as usize)
    }

    /// Start an outgoing connection; completion is reported by `service`
    pub fn connect(&mut self, address: SocketAddr, channel_count: u8) -> Result<PeerId, NetworkError> {
        if channel_count == 0 || channel_count > self.channel_limit {
            return Err(NetworkError::InvalidChannel {
                channel: channel_count,
                count: self.channel_limit,
            });
        }

        let connect_id = uuid::Uuid::new_v4().as_u128() as u32;
        let now = Instant::now();

        let peer = self
            .peers
            .iter_mut()
            .find(|p| p.state == PeerState::Disconnected)
            .ok_or(NetworkError::PeerLimitReached)?;

        peer.setup(
            address,
            connect_id,
            crate::protocol::NO_PEER_ID,
            channel_count,
            PeerState::Connecting,
            now,
        );
        let request = Packet::connect(peer.id as u16, channel_count, connect_id);
        peer.queue_reliable(request, now);

        tracing::debug!("Peer {} connecting to {}", peer.id, address);
        Ok(peer.id)
    }

    /// Queue `payload` for one connected peer
    pub fn send(
        &mut self,
        peer: PeerId,
        channel: u8,
        flags: PacketFlags,
        payload: &[u8],
    ) -> Result<(), NetworkError> {
        check_payload(payload)?;
        let payload = Bytes::copy_from_slice(payload);
        let target = self
            .peer_mut(peer)
            .filter(|p| p.state == PeerState::Connected)
            .ok_or(NetworkError::UnknownPeer(peer))?;
        queue_data(target, channel, flags, payload, Instant::now())
    }

    /// Queue `payload` for every connected peer
    pub fn broadcast(&mut self, channel: u8, flags: PacketFlags, payload: &[u8]) -> Result<(), NetworkError> {
        check_payload(payload)?;
        let payload = Bytes::copy_from_slice(payload);
        let now = Instant::now();

        for peer in self.peers.iter_mut().filter(|p| p.state == PeerState::Connected) {
            queue_data(peer, channel, flags, payload.clone(), now)?;
        }
        Ok(())
    }

    /// Request a graceful disconnect; completion is reported by `service`
    ///
    /// A peer that has not finished connecting is released at once,
    /// without an event.
    pub fn disconnect(&mut self, peer: PeerId) {
        let now = Instant::now();
        let Some(target) = self.peer_mut(peer) else {
            return;
        };

        let state = target.state;
        match state {
            PeerState::Connected => {
                let request = target.packet(Command::Disconnect);
                target.queue_reliable(request, now);
                target.state = PeerState::Disconnecting;
                tracing::debug!("Peer {} disconnecting", peer);
            }
            // Never reported as connected, so nothing to report now
            PeerState::Connecting | PeerState::AcknowledgingConnect => {
                tracing::debug!("Peer {} abandoned while {}", peer, state);
                self.reset(peer);
            }
            PeerState::Disconnecting | PeerState::Zombie | PeerState::Disconnected => {}
        }
    }

    /// Drop a connection immediately without notifying the remote side
    pub fn reset(&mut self, peer: PeerId) {
        if let Some(target) = self.peer_mut(peer) {
            if target.state != PeerState::Disconnected {
                tracing::debug!("Peer {} reset from state {}", peer, target.state);
            }
            target.reset();
            self.events.retain(|event| event.peer() != peer);
        }
    }

    /// Push every queued datagram onto the wire
    pub fn flush(&mut self) -> Result<(), NetworkError> {
        let now = Instant::now();

        for peer in self.peers.iter_mut().filter(|p| p.has_outgoing()) {
            let Some(address) = peer.address else {
                while peer.pop_outgoing().is_some() {}
                continue;
            };

            while let Some(datagram) = peer.pop_outgoing() {
                match self.socket.send_to(&datagram, address) {
                    Ok(sent) => {
                        self.stats.packets_sent += 1;
                        self.stats.bytes_sent += sent as u64;
                        peer.last_send = now;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        tracing::trace!("Send buffer full, dropping datagram to {}", address);
                    }
                    Err(ref e) if is_transient(e) => {
                        tracing::debug!("Transient send error to {}: {}", address, e);
                    }
                    Err(e) => return Err(NetworkError::SendFailed(e.to_string())),
                }
            }
        }

        Ok(())
    }

    /// Wait up to `timeout` for one event
    ///
    /// Each round reads pending datagrams, runs retransmission and keepalive
    /// timers and flushes. A zero timeout performs exactly one round.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<HostEvent>, NetworkError> {
        let deadline = Instant::now() + timeout;
        let mut empty_rounds = 0u32;

        loop {
            if let Some(event) = self.dispatch() {
                return Ok(Some(event));
            }

            let received = self.receive()?;
            self.check_timers(Instant::now());
            self.flush()?;

            if let Some(event) = self.dispatch() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            if received > 0 {
                empty_rounds = 0;
                continue;
            }

            // Adaptive backoff: start with spin, then yield, then sleep
            empty_rounds = empty_rounds.saturating_add(1);
            if empty_rounds < 10 {
                std::hint::spin_loop();
            } else if empty_rounds < 100 {
                thread::yield_now();
            } else {
                thread::sleep((deadline - now).min(Duration::from_micros(50)));
            }
        }
    }

    /// Pop the next event, releasing slots whose disconnect it reports
    fn dispatch(&mut self) -> Option<HostEvent> {
        let event = self.events.pop_front()?;

        if let HostEvent::Disconnect { peer } = event {
            if let Some(target) = self.peer_mut(peer) {
                if target.state == PeerState::Zombie {
                    target.reset();
                }
            }
        }

        Some(event)
    }

    /// Make the receive call after the next `calls` ones fail
    #[cfg(test)]
    pub(crate) fn fail_receive_after(&mut self, calls: usize) {
        self.receive_failure_in = Some(calls);
    }

    #[cfg(test)]
    fn injected_failure(&mut self) -> Option<NetworkError> {
        match self.receive_failure_in {
            Some(0) => {
                self.receive_failure_in = None;
                Some(NetworkError::ReceiveFailed("injected failure".to_string()))
            }
            Some(ref mut left) => {
                *left -= 1;
                None
            }
            None => None,
        }
    }

    #[cfg(not(test))]
    fn injected_failure(&mut self) -> Option<NetworkError> {
        None
    }

    /// Drain the socket, returning the number of datagrams read
    fn receive(&mut self) -> Result<usize, NetworkError> {
        if let Some(e) = self.injected_failure() {
            return Err(e);
        }

        let mut count = 0;

        while count < MAX_DATAGRAMS_PER_ROUND {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, from)) => {
                    count += 1;
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;

                    let data = Bytes::copy_from_slice(&self.recv_buffer[..size]);
                    self.handle_datagram(data, from, Instant::now());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if is_transient(e) => {
                    tracing::debug!("Ignoring transient receive error: {}", e);
                }
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            }
        }

        Ok(count)
    }

    fn handle_datagram(&mut self, data: Bytes, from: SocketAddr, now: Instant) {
        let Some(packet) = Packet::deserialize(data) else {
            tracing::trace!("Dropping malformed datagram from {}", from);
            return;
        };

        if packet.command == Command::Connect {
            self.handle_connect(packet, from, now);
            return;
        }

        let id = PeerId::from(packet.peer_id);
        let Some(peer) = self.peer_mut(id) else {
            return;
        };
        if peer.state == PeerState::Disconnected
            || peer.address != Some(from)
            || peer.connect_id != packet.connect_id
        {
            tracing::trace!("Dropping {:?} from {} for stale slot {}", packet.command, from, id);
            return;
        }
        peer.last_receive = now;

        // The requester only sends traffic once it has our VerifyConnect,
        // even if its ack for it got lost.
        if peer.state == PeerState::AcknowledgingConnect && packet.command != Command::Ack {
            peer.state = PeerState::Connected;
            tracing::debug!("Peer {} connected", id);
            self.events.push_back(HostEvent::Connect { peer: id });
        }

        match packet.command {
            Command::Ack => self.handle_ack(id, packet.sequence),
            command if command.is_reliable() => self.handle_sequenced(id, packet),
            _ => self.handle_unsequenced(id, packet),
        }
    }

    /// Run a reliable command through the reorder buffer, then ack it
    ///
    /// The ack goes out after delivery so it carries the slot a
    /// VerifyConnect just assigned us.
    fn handle_sequenced(&mut self, id: PeerId, packet: Packet) {
        let sequence = packet.sequence;
        let Some(peer) = self.peer_mut(id) else {
            return;
        };

        match peer.accept_reliable(packet) {
            Accepted::Ready(ready) => {
                for command in ready {
                    self.handle_reliable(id, command);
                }
            }
            Accepted::Held | Accepted::Duplicate => {}
            Accepted::Refused => {
                tracing::trace!("Reorder buffer full for peer {}, leaving {} unacked", id, sequence);
                return;
            }
        }

        if let Some(peer) = self.peer_mut(id) {
            peer.queue_ack(sequence);
        }
    }

    fn handle_unsequenced(&mut self, id: PeerId, packet: Packet) {
        let Some(peer) = self.peer(id) else {
            return;
        };
        if peer.state.is_connected() && packet.channel < peer.channel_count {
            self.events.push_back(HostEvent::Receive {
                peer: id,
                channel: packet.channel,
                payload: packet.payload,
            });
        }
    }

    fn handle_connect(&mut self, packet: Packet, from: SocketAddr, now: Instant) {
        let Some((remote_slot, channel_count)) = packet.parse_connect() else {
            return;
        };

        // Retransmitted request for a slot we already handed out
        if let Some(existing) = self.peers.iter_mut().find(|p| {
            p.state != PeerState::Disconnected
                && p.address == Some(from)
                && p.connect_id == packet.connect_id
        }) {
            existing.queue_ack(packet.sequence);
            return;
        }

        if channel_count == 0 {
            tracing::debug!("Refusing connect from {} with no channels", from);
            return;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let Some(peer) = self
            .peers
            .iter_mut()
            .find(|p| p.state == PeerState::Disconnected)
        else {
            tracing::debug!("Refusing connect from {}: all slots in use", from);
            return;
        };

        peer.setup(
            from,
            packet.connect_id,
            remote_slot,
            channel_count,
            PeerState::AcknowledgingConnect,
            now,
        );
        peer.mark_received(packet.sequence);
        peer.queue_ack(packet.sequence);

        let verify = Packet::verify_connect(remote_slot, peer.id as u16, packet.connect_id);
        peer.queue_reliable(verify, now);

        tracing::debug!("Peer {} accepting connect from {}", peer.id, from);
    }

    fn handle_ack(&mut self, id: PeerId, sequence: u32) {
        let Some(peer) = self.peer_mut(id) else {
            return;
        };

        match (peer.acknowledge(sequence), peer.state) {
            (Some(Command::VerifyConnect), PeerState::AcknowledgingConnect) => {
                peer.state = PeerState::Connected;
                tracing::debug!("Peer {} connected", id);
                self.events.push_back(HostEvent::Connect { peer: id });
            }
            (Some(Command::Disconnect), PeerState::Disconnecting) => {
                peer.abandon_in_flight();
                peer.state = PeerState::Zombie;
                tracing::debug!("Peer {} disconnect acknowledged", id);
                self.events.push_back(HostEvent::Disconnect { peer: id });
            }
            _ => {}
        }
    }

    fn handle_reliable(&mut self, id: PeerId, packet: Packet) {
        let Some(peer) = self.peer_mut(id) else {
            return;
        };

        match packet.command {
            Command::VerifyConnect => {
                if peer.state != PeerState::Connecting {
                    return;
                }
                let Some(assigned) = packet.parse_verify_connect() else {
                    return;
                };
                peer.remote_id = assigned;
                peer.state = PeerState::Connected;
                tracing::debug!("Peer {} connected as remote slot {}", id, assigned);
                self.events.push_back(HostEvent::Connect { peer: id });
            }
            Command::Disconnect => {
                if !peer.state.is_active() {
                    return;
                }
                peer.abandon_in_flight();
                peer.state = PeerState::Zombie;
                tracing::debug!("Peer {} disconnected by remote", id);
                self.events.push_back(HostEvent::Disconnect { peer: id });
            }
            Command::SendReliable => {
                if peer.state.is_connected() && packet.channel < peer.channel_count {
                    self.events.push_back(HostEvent::Receive {
                        peer: id,
                        channel: packet.channel,
                        payload: packet.payload,
                    });
                }
            }
            Command::Ping | Command::Connect | Command::Ack | Command::SendUnsequenced => {}
        }
    }

    fn check_timers(&mut self, now: Instant) {
        for peer in self.peers.iter_mut().filter(|p| p.state.is_active()) {
            if peer
                .retransmit(now, self.retransmit_timeout, self.peer_timeout)
                .is_err()
            {
                // Half-open incoming connections were never reported
                if peer.state == PeerState::AcknowledgingConnect {
                    tracing::debug!(
                        "Half-open connection on peer {} from {} expired",
                        peer.id,
                        peer.address.map(|a| a.to_string()).unwrap_or_default()
                    );
                    peer.reset();
                    continue;
                }

                tracing::warn!(
                    "Peer {} ({}) timed out in state {}",
                    peer.id,
                    peer.address.map(|a| a.to_string()).unwrap_or_default(),
                    peer.state
                );
                peer.abandon_in_flight();
                peer.state = PeerState::Zombie;
                self.events.push_back(HostEvent::Disconnect { peer: peer.id });
                continue;
            }

            if peer.needs_ping(now, self.ping_interval) {
                let ping = peer.packet(Command::Ping);
                peer.queue_reliable(ping, now);
            }
        }
    }
}

fn check_payload(payload: &[u8]) -> Result<(), NetworkError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(NetworkError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

fn queue_data(
    peer: &mut Peer,
    channel: u8,
    flags: PacketFlags,
    payload: Bytes,
    now: Instant,
) -> Result<(), NetworkError> {
    if channel >= peer.channel_count {
        return Err(NetworkError::InvalidChannel {
            channel,
            count: peer.channel_count,
        });
    }

    if flags.is_reliable() {
        let packet = Packet::data(Command::SendReliable, peer.remote_id, channel, peer.connect_id, payload);
        peer.queue_reliable(packet, now);
    } else {
        let packet = Packet::data(Command::SendUnsequenced, peer.remote_id, channel, peer.connect_id, payload);
        peer.queue_unreliable(packet);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
