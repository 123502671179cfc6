//! Error types

use std::time::Duration;
use thiserror::Error;

use crate::network::PeerId;

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-level result
pub type Result<T> = std::result::Result<T, Error>;

/// Transport and session errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network layer used before initialize()")]
    NotInitialized,

    #[error("failed to bind socket: {0}")]
    BindFailed(String),

    #[error("could not resolve {0}")]
    AddressResolution(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no free peer slot")]
    PeerLimitReached,

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("channel {channel} out of range (peer has {count})")]
    InvalidChannel { channel: u8, count: u8 },

    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("{peers} peer(s) did not acknowledge disconnect and were reset")]
    ForcedDisconnect { peers: usize },
}
