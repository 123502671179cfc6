//! # Duplex Session
//!
//! Client/server session layer over UDP with two channels: a reliable,
//! ordered channel and an unreliable, unsequenced one. Built for small
//! real-time payloads such as position updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  session/          - Caller-facing sessions               │
//! │  ├── client.rs     - One connection to a server           │
//! │  ├── server.rs     - Many clients, start/stop             │
//! │  ├── registry.rs   - Connected peers by id                │
//! │  └── disconnect.rs - Graceful teardown, forced fallback   │
//! │                                                           │
//! │  network/          - Transport host                       │
//! │  ├── context.rs    - Process-wide initialize guard        │
//! │  ├── host.rs       - service/connect/send/flush           │
//! │  ├── peer.rs       - Sequencing and retransmission        │
//! │  └── udp.rs        - socket2 sockets                      │
//! │                                                           │
//! │  protocol.rs       - Datagram header codec                │
//! │  message.rs        - Envelopes returned by poll           │
//! │  position.rs       - "<id>-<x>,<y>" updates               │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing runs in the background: a session only touches the socket from
//! inside its own method calls. `connect` and `disconnect`/`stop` may block
//! up to the configured timeout; `send`, `broadcast` and `poll` never wait.

pub mod config;
pub mod constants;
pub mod error;
pub mod message;
pub mod network;
pub mod position;
pub mod protocol;
pub mod session;

pub use config::AppConfig;
pub use error::{Error, NetworkError, Result};
pub use message::{Message, MessageKind};
pub use network::{initialize, NetworkContext, PeerId};
pub use position::PositionUpdate;
pub use protocol::DeliveryType;
pub use session::{ClientSession, ServerSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
