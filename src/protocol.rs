//! Wire protocol for session datagrams
//!
//! ## Packet Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Datagram Header (14 bytes)                        │
//! ├──────────┬──────────┬──────────┬──────────┬────────────┬─────────────────┤
//! │ Magic(2) │  Cmd(1)  │ Chan(1)  │PeerId(2) │   Seq(4)   │  ConnectId(4)   │
//! │  0x5E55  │ see below│  0..N    │ u16 LE   │   u32 LE   │    u32 LE       │
//! ├──────────┴──────────┴──────────┴──────────┴────────────┴─────────────────┤
//! │                        Command Payload (variable)                        │
//! │                        Max: 1386 bytes                                   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `PeerId` is the slot the *receiver* assigned to the sender, or
//! [`NO_PEER_ID`] on a connect request. For `Ack` the sequence field holds
//! the acknowledged sequence number.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{RELIABLE_CHANNEL, UNRELIABLE_CHANNEL};

/// Magic number for packet identification
pub const PACKET_MAGIC: u16 = 0x5E55;

/// Largest datagram we put on the wire
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Header size in bytes
pub const HEADER_SIZE: usize = 14;

/// Maximum command payload per datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Peer id used before the receiver has assigned a slot
pub const NO_PEER_ID: u16 = 0xFFFF;

/// Protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Connection request, payload: sender slot (u16), channel count (u8)
    Connect = 0x01,
    /// Connection accepted, payload: slot assigned to the requester (u16)
    VerifyConnect = 0x02,
    /// Acknowledges the reliable command whose sequence is in the header
    Ack = 0x03,
    /// Graceful disconnect request
    Disconnect = 0x04,
    /// Keepalive
    Ping = 0x05,
    /// Reliable application data
    SendReliable = 0x06,
    /// Best-effort application data
    SendUnsequenced = 0x07,
}

impl TryFrom<u8> for Command {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::VerifyConnect),
            0x03 => Ok(Self::Ack),
            0x04 => Ok(Self::Disconnect),
            0x05 => Ok(Self::Ping),
            0x06 => Ok(Self::SendReliable),
            0x07 => Ok(Self::SendUnsequenced),
            _ => Err(()),
        }
    }
}

impl Command {
    /// Whether the command is sequenced, acknowledged and retransmitted
    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Ack | Self::SendUnsequenced)
    }
}

/// Packet flags chosen by the caller of `send`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const RELIABLE: u8 = 0x01;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn set_reliable(mut self, value: bool) -> Self {
        if value {
            self.0 |= Self::RELIABLE;
        } else {
            self.0 &= !Self::RELIABLE;
        }
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.0 & Self::RELIABLE != 0
    }
}

/// Caller-selected delivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryType {
    /// Ordered, guaranteed, de-duplicated
    Reliable,
    /// Best effort, unordered, may be dropped
    Unreliable,
}

impl DeliveryType {
    /// Channel this delivery type is sent on
    pub fn channel(self) -> u8 {
        match self {
            Self::Reliable => RELIABLE_CHANNEL,
            Self::Unreliable => UNRELIABLE_CHANNEL,
        }
    }

    /// Transport flags for this delivery type
    pub fn flags(self) -> PacketFlags {
        match self {
            Self::Reliable => PacketFlags::new().set_reliable(true),
            Self::Unreliable => PacketFlags::new(),
        }
    }
}

/// A single datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub channel: u8,
    pub peer_id: u16,
    pub sequence: u32,
    pub connect_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(command: Command, peer_id: u16, connect_id: u32) -> Self {
        Self {
            command,
            channel: 0,
            peer_id,
            sequence: 0,
            connect_id,
            payload: Bytes::new(),
        }
    }

    /// Connection request carrying our slot id and channel count
    pub fn connect(local_slot: u16, channel_count: u8, connect_id: u32) -> Self {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u16_le(local_slot);
        payload.put_u8(channel_count);

        Self {
            payload: payload.freeze(),
            ..Self::new(Command::Connect, NO_PEER_ID, connect_id)
        }
    }

    /// Parse a Connect payload into (sender slot, channel count)
    pub fn parse_connect(&self) -> Option<(u16, u8)> {
        if self.command != Command::Connect || self.payload.len() < 3 {
            return None;
        }
        let mut data = self.payload.clone();
        Some((data.get_u16_le(), data.get_u8()))
    }

    /// Connection acceptance telling the requester which slot it got
    pub fn verify_connect(peer_id: u16, assigned_slot: u16, connect_id: u32) -> Self {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16_le(assigned_slot);

        Self {
            payload: payload.freeze(),
            ..Self::new(Command::VerifyConnect, peer_id, connect_id)
        }
    }

    /// Parse a VerifyConnect payload into the assigned slot
    pub fn parse_verify_connect(&self) -> Option<u16> {
        if self.command != Command::VerifyConnect || self.payload.len() < 2 {
            return None;
        }
        Some(self.payload.clone().get_u16_le())
    }

    pub fn ack(peer_id: u16, sequence: u32, connect_id: u32) -> Self {
        Self {
            sequence,
            ..Self::new(Command::Ack, peer_id, connect_id)
        }
    }

    pub fn data(command: Command, peer_id: u16, channel: u8, connect_id: u32, payload: Bytes) -> Self {
        Self {
            channel,
            payload,
            ..Self::new(command, peer_id, connect_id)
        }
    }

    /// Serialize packet to bytes for network transmission
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());

        buf.put_u16_le(PACKET_MAGIC);
        buf.put_u8(self.command as u8);
        buf.put_u8(self.channel);
        buf.put_u16_le(self.peer_id);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.connect_id);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Deserialize packet from bytes
    pub fn deserialize(mut data: Bytes) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        if data.get_u16_le() != PACKET_MAGIC {
            return None;
        }

        let command = Command::try_from(data.get_u8()).ok()?;
        let channel = data.get_u8();
        let peer_id = data.get_u16_le();
        let sequence = data.get_u32_le();
        let connect_id = data.get_u32_le();

        Some(Self {
            command,
            channel,
            peer_id,
            sequence,
            connect_id,
            payload: data,
        })
    }

    /// Get packet size including header
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
