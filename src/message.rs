//! Message envelopes handed to session callers

use bytes::Bytes;

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    Disconnect,
    Data,
}

/// One event drained by `poll`
///
/// Envelopes own their payload, so they stay valid across later polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    peer_id: u32,
    kind: MessageKind,
    payload: Bytes,
}

impl Message {
    pub fn connect(peer_id: u32) -> Self {
        Self {
            peer_id,
            kind: MessageKind::Connect,
            payload: Bytes::new(),
        }
    }

    pub fn disconnect(peer_id: u32) -> Self {
        Self {
            peer_id,
            kind: MessageKind::Disconnect,
            payload: Bytes::new(),
        }
    }

    /// Data envelope, truncating `payload` to `max_len` bytes
    pub fn data(peer_id: u32, mut payload: Bytes, max_len: usize) -> Self {
        if payload.len() > max_len {
            tracing::debug!(
                "Truncating {}-byte payload from peer {} to {}",
                payload.len(),
                peer_id,
                max_len
            );
            payload.truncate(max_len);
        }

        Self {
            peer_id,
            kind: MessageKind::Data,
            payload,
        }
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, lossy for non-UTF-8 bytes
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
