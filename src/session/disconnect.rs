//! Graceful disconnect with a forced fallback
//!
//! Both sessions tear connections down the same way: ask every target to
//! disconnect, service the host until each one is confirmed or the timeout
//! runs out, then reset whatever is left.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::error::NetworkError;
use crate::network::{Host, HostEvent, PeerId, PeerState};

/// Outcome of a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    /// Peers that acknowledged the disconnect
    pub confirmed: Vec<PeerId>,
    /// Peers that had to be reset
    pub forced: Vec<PeerId>,
}

impl Teardown {
    pub fn is_graceful(&self) -> bool {
        self.forced.is_empty()
    }

    /// `Ok` only if every target was confirmed
    pub fn into_result(self) -> Result<(), NetworkError> {
        if self.forced.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::ForcedDisconnect {
                peers: self.forced.len(),
            })
        }
    }
}

/// Disconnect every peer in `targets`, waiting at most `timeout`
///
/// Data arriving during teardown is discarded. Peers that connect while we
/// wait are disconnected too and join the target set. Every target is
/// disconnected on return, whatever the outcome.
pub fn disconnect_peers(
    host: &mut Host,
    targets: impl IntoIterator<Item = PeerId>,
    timeout: Duration,
) -> Teardown {
    let mut pending: BTreeSet<PeerId> = targets.into_iter().collect();
    let mut outcome = Teardown::default();

    if pending.is_empty() {
        return outcome;
    }

    for &peer in &pending {
        host.disconnect(peer);
    }
    // Peers that never finished connecting are released on the spot
    pending.retain(|&peer| {
        host.peer_state(peer)
            .is_some_and(|state| state != PeerState::Disconnected)
    });
    if let Err(e) = host.flush() {
        tracing::warn!("Flush failed while disconnecting: {}", e);
    }

    let deadline = Instant::now() + timeout;

    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match host.service(remaining) {
            Ok(Some(HostEvent::Disconnect { peer })) => {
                if pending.remove(&peer) {
                    outcome.confirmed.push(peer);
                }
            }
            Ok(Some(HostEvent::Connect { peer })) => {
                tracing::debug!("Peer {} connected during teardown, disconnecting", peer);
                host.disconnect(peer);
                pending.insert(peer);
            }
            Ok(Some(HostEvent::Receive { peer, .. })) => {
                tracing::trace!("Discarding data from peer {} during teardown", peer);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Transport error during disconnect: {}", e);
                break;
            }
        }
    }

    for peer in pending {
        tracing::warn!("Peer {} did not confirm disconnect, resetting", peer);
        host.reset(peer);
        outcome.forced.push(peer);
    }

    outcome
}
