//! Protocol and session constants

/// Default server port
pub const DEFAULT_PORT: u16 = 7000;

/// Default server host for clients
pub const DEFAULT_HOST: &str = "localhost";

/// Upper bound for blocking connect/disconnect waits (ms)
pub const TIMEOUT_MS: u64 = 5000;

/// Channel carrying reliable, ordered packets
pub const RELIABLE_CHANNEL: u8 = 0;

/// Channel carrying unsequenced, best-effort packets
pub const UNRELIABLE_CHANNEL: u8 = 1;

/// Number of channels allocated per connection
pub const CHANNEL_COUNT: u8 = 2;

/// Maximum simultaneous clients on a server
pub const MAX_CLIENTS: usize = 64;

/// Maximum application payload length delivered by `poll`
pub const MAX_MESSAGE_LEN: usize = 100;

/// Source id stamped on every envelope a client receives
pub const SERVER_PEER_ID: u32 = 0;

/// Initial retransmission timeout for reliable commands (ms)
pub const DEFAULT_RETRANSMIT_MS: u64 = 100;

/// Keepalive interval on idle connections (ms)
pub const DEFAULT_PING_INTERVAL_MS: u64 = 500;

/// Unacknowledged reliable traffic older than this drops the peer (ms)
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 10_000;

/// Demo loop period (ms)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;
