//! Client and server sessions
//!
//! Sessions sit on top of a [`Host`](crate::network::Host) and translate
//! its events into [`Message`](crate::message::Message) envelopes.

pub mod registry;
pub mod disconnect;
pub mod client;
pub mod server;

pub use client::{ClientSession, ConnectionState};
pub use disconnect::{disconnect_peers, Teardown};
pub use registry::{PeerRegistry, RegisteredPeer};
pub use server::ServerSession;
