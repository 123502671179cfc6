//! `"<peerId>-<x>,<y>"` position updates exchanged by game clients

use std::fmt;
use std::str::FromStr;

/// A player's grid position tagged with its peer id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub peer_id: u32,
    pub x: i32,
    pub y: i32,
}

/// Malformed position text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed position update: {0:?}")]
pub struct ParsePositionError(String);

impl PositionUpdate {
    pub fn new(peer_id: u32, x: i32, y: i32) -> Self {
        Self { peer_id, x, y }
    }

    /// Parse from a raw payload; a trailing NUL from C senders is ignored
    pub fn from_payload(payload: &[u8]) -> Result<Self, ParsePositionError> {
        let text = String::from_utf8_lossy(payload);
        text.trim_end_matches('\0').parse()
    }
}

impl fmt::Display for PositionUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{},{}", self.peer_id, self.x, self.y)
    }
}

impl FromStr for PositionUpdate {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePositionError(s.to_string());

        let (id, coords) = s.split_once('-').ok_or_else(err)?;
        let (x, y) = coords.split_once(',').ok_or_else(err)?;

        Ok(Self {
            peer_id: id.trim().parse().map_err(|_| err())?,
            x: x.trim().parse().map_err(|_| err())?,
            y: y.trim().parse().map_err(|_| err())?,
        })
    }
}
