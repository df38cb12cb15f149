//! Peer records — the gossip unit.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// What one node knows about another, as spread by gossip.
///
/// The transport address is opaque to the topology layer; the
/// transport implementation decides how to interpret it. Records carry
/// a wall-clock timestamp and merge last-writer-wins, so stale gossip
/// never overwrites fresher knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's identifier.
    pub id: NodeId,

    /// Opaque transport address.
    pub addr: String,

    /// Geospatial position, if the peer has announced one.
    pub position: Option<(f64, f64)>,

    /// When this record was produced (unix millis).
    pub timestamp: u64,
}

impl PeerRecord {
    /// Create a record stamped with the current time.
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            position: None,
            timestamp: unix_millis(),
        }
    }

    /// Set the announced position.
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    /// Check if this record is newer than another.
    pub fn is_newer_than(&self, other: &PeerRecord) -> bool {
        self.timestamp > other.timestamp
    }

    /// Merge with another record for the same peer, keeping the newer.
    /// Returns true if self was updated.
    pub fn merge(&mut self, other: PeerRecord) -> bool {
        if other.id == self.id && other.is_newer_than(self) {
            *self = other;
            true
        } else {
            false
        }
    }
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
