//! Per-peer protocol state
//!
//! A [`Peer`] is one slot in a host's fixed pool. It owns the reliable
//! sequencing for the connection: outgoing sequence numbers, the set of
//! in-flight commands awaiting acknowledgement, and the reorder buffer for
//! incoming commands.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::protocol::{Command, Packet};

/// Host-assigned peer identifier (slot index)
pub type PeerId = u32;

/// Early reliable commands buffered per peer before we start dropping
const MAX_HELD_COMMANDS: usize = 256;

/// Cap on retransmission back-off doublings
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Connection state of a peer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Slot is free
    Disconnected,
    /// We sent Connect and wait for VerifyConnect
    Connecting,
    /// We accepted a Connect and wait for the VerifyConnect ack
    AcknowledgingConnect,
    /// Connection established
    Connected,
    /// We sent Disconnect and wait for its ack
    Disconnecting,
    /// Connection is over; the slot is released once its Disconnect event
    /// has been dispatched
    Zombie,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::AcknowledgingConnect => write!(f, "acknowledging-connect"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Zombie => write!(f, "zombie"),
        }
    }
}

impl PeerState {
    /// States counted by `Host::connected_peers`
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Disconnecting)
    }

    /// States with live protocol timers
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AcknowledgingConnect | Self::Connected | Self::Disconnecting
        )
    }
}

/// A reliable command awaiting acknowledgement
#[derive(Debug)]
struct InFlight {
    command: Command,
    datagram: Bytes,
    first_sent: Instant,
    last_sent: Instant,
    retries: u32,
}

/// Fate of an incoming reliable command
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Accepted {
    /// Deliverable now, followed by any held commands it released
    Ready(Vec<Packet>),
    /// Arrived early and is buffered
    Held,
    /// Already delivered
    Duplicate,
    /// Arrived early with the reorder buffer full
    Refused,
}

/// Reliable traffic went unacknowledged past the peer timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

/// One peer slot
#[derive(Debug)]
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) state: PeerState,
    pub(crate) address: Option<SocketAddr>,
    /// Slot the remote side assigned to us
    pub(crate) remote_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) channel_count: u8,
    next_outgoing: u32,
    next_incoming: u32,
    in_flight: BTreeMap<u32, InFlight>,
    held: BTreeMap<u32, Packet>,
    outgoing: VecDeque<Bytes>,
    pub(crate) last_send: Instant,
    pub(crate) last_receive: Instant,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: PeerState::Disconnected,
            address: None,
            remote_id: crate::protocol::NO_PEER_ID,
            connect_id: 0,
            channel_count: 0,
            next_outgoing: 0,
            next_incoming: 0,
            in_flight: BTreeMap::new(),
            held: BTreeMap::new(),
            outgoing: VecDeque::new(),
            last_send: now,
            last_receive: now,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Bind the slot to a remote endpoint
    pub(crate) fn setup(
        &mut self,
        address: SocketAddr,
        connect_id: u32,
        remote_id: u16,
        channel_count: u8,
        state: PeerState,
        now: Instant,
    ) {
        self.reset();
        self.address = Some(address);
        self.connect_id = connect_id;
        self.remote_id = remote_id;
        self.channel_count = channel_count;
        self.state = state;
        self.last_send = now;
        self.last_receive = now;
    }

    /// Release the slot, dropping all queued and in-flight traffic
    pub(crate) fn reset(&mut self) {
        self.state = PeerState::Disconnected;
        self.address = None;
        self.remote_id = crate::protocol::NO_PEER_ID;
        self.connect_id = 0;
        self.channel_count = 0;
        self.next_outgoing = 0;
        self.next_incoming = 0;
        self.in_flight.clear();
        self.held.clear();
        self.outgoing.clear();
    }

    /// Stop retransmitting; queued datagrams (acks) still go out
    pub(crate) fn abandon_in_flight(&mut self) {
        self.in_flight.clear();
        self.held.clear();
    }

    /// Header-only packet addressed to the remote side
    pub(crate) fn packet(&self, command: Command) -> Packet {
        Packet::new(command, self.remote_id, self.connect_id)
    }

    /// Sequence, remember and queue a reliable command
    pub(crate) fn queue_reliable(&mut self, mut packet: Packet, now: Instant) {
        packet.sequence = self.next_outgoing;
        self.next_outgoing = self.next_outgoing.wrapping_add(1);

        let datagram = packet.serialize();
        self.in_flight.insert(packet.sequence, InFlight {
            command: packet.command,
            datagram: datagram.clone(),
            first_sent: now,
            last_sent: now,
            retries: 0,
        });
        self.outgoing.push_back(datagram);
    }

    /// Queue a datagram that is sent once and forgotten
    pub(crate) fn queue_unreliable(&mut self, packet: Packet) {
        self.outgoing.push_back(packet.serialize());
    }

    pub(crate) fn queue_ack(&mut self, sequence: u32) {
        let ack = Packet::ack(self.remote_id, sequence, self.connect_id);
        self.queue_unreliable(ack);
    }

    /// Treat `sequence` as already delivered (the Connect that created us)
    pub(crate) fn mark_received(&mut self, sequence: u32) {
        self.next_incoming = sequence.wrapping_add(1);
    }

    /// Drop an acknowledged command, returning what it was
    pub(crate) fn acknowledge(&mut self, sequence: u32) -> Option<Command> {
        self.in_flight.remove(&sequence).map(|f| f.command)
    }

    /// Accept a reliable command
    ///
    /// Only [`Accepted::Refused`] commands must go unacknowledged; the
    /// sender retransmits them once the reorder buffer drains.
    pub(crate) fn accept_reliable(&mut self, packet: Packet) -> Accepted {
        let sequence = packet.sequence;
        // Signed distance survives sequence wrap-around
        let distance = sequence.wrapping_sub(self.next_incoming) as i32;

        if distance < 0 {
            return Accepted::Duplicate;
        }

        if distance > 0 {
            if self.held.contains_key(&sequence) {
                return Accepted::Held;
            }
            if self.held.len() >= MAX_HELD_COMMANDS {
                return Accepted::Refused;
            }
            self.held.insert(sequence, packet);
            return Accepted::Held;
        }

        let mut ready = vec![packet];
        self.next_incoming = self.next_incoming.wrapping_add(1);
        while let Some(next) = self.held.remove(&self.next_incoming) {
            ready.push(next);
            self.next_incoming = self.next_incoming.wrapping_add(1);
        }
        Accepted::Ready(ready)
    }

    /// Requeue overdue reliable commands with exponential back-off
    pub(crate) fn retransmit(
        &mut self,
        now: Instant,
        rto: Duration,
        peer_timeout: Duration,
    ) -> Result<usize, TimedOut> {
        let mut requeued = 0;

        for flight in self.in_flight.values_mut() {
            if now.duration_since(flight.first_sent) >= peer_timeout {
                return Err(TimedOut);
            }

            let backoff = rto * (1u32 << flight.retries.min(MAX_BACKOFF_SHIFT));
            if now.duration_since(flight.last_sent) >= backoff {
                self.outgoing.push_back(flight.datagram.clone());
                flight.last_sent = now;
                flight.retries += 1;
                requeued += 1;
            }
        }

        Ok(requeued)
    }

    /// Idle connected peers send a keepalive so dead links get noticed
    pub(crate) fn needs_ping(&self, now: Instant, interval: Duration) -> bool {
        self.state == PeerState::Connected
            && self.in_flight.is_empty()
            && now.duration_since(self.last_send) >= interval
    }

    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub(crate) fn pop_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
