//! Transport layer over UDP
//!
//! Contains modules for:
//! - Process-wide initialization
//! - UDP socket creation
//! - Per-peer reliable sequencing
//! - The transport host that drives connections and emits events

pub mod context;
pub mod udp;
pub mod peer;
pub mod host;

pub use context::{initialize, is_initialized, NetworkContext};
pub use udp::{create_socket, resolve, NetworkStats};
pub use peer::{Peer, PeerId, PeerState};
pub use host::{Host, HostConfig, HostEvent};
