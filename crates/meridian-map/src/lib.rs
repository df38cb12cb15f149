//! Meridian Distributed Map
//!
//! Local state and partitioning rules for the distributed key-value
//! map. Keys hash into ID space; each key is owned by the live node
//! closest to its hash, with replicas on the next-closest nodes.
//! Conflicting writes resolve last-writer-wins by version timestamp,
//! writer id as tie-break.
//!
//! The node runtime drives this crate: it owns a [`MapStore`] per
//! named map, consults [`replica_set`] for routing decisions, and
//! streams [`drain_not_owned`](MapStore::drain_not_owned) batches to
//! new owners when the topology changes.

mod entry;
mod store;

pub use entry::{MapEntry, Version};
pub use store::MapStore;

use meridian_topology::{NodeId, RouteError};
use thiserror::Error;

/// Replicas kept beyond the primary owner.
pub const DEFAULT_REPLICATION: usize = 2;

/// Result type for map operations.
pub type Result<T> = std::result::Result<T, MapError>;

/// Errors surfaced by map operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapError {
    /// The key has no live value.
    #[error("key not found")]
    NotFound,

    /// The contacted node does not currently consider itself the
    /// key's owner. Transient during ownership handoff.
    #[error("ownership conflict: contacted {contacted}, it believes {believed_owner}")]
    OwnershipConflict {
        contacted: NodeId,
        believed_owner: NodeId,
    },

    /// The request could not be routed.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The remote round-trip exceeded its deadline.
    #[error("map request timed out")]
    Timeout,

    /// The key or value failed to encode/decode.
    #[error(transparent)]
    Codec(#[from] meridian_codec::CodecError),
}

/// How many replica acknowledgments a write waits for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub enum ReplicaAck {
    /// Primary applies the write; replication is fire-and-forget.
    None,
    /// Wait for one replica to acknowledge.
    #[default]
    One,
    /// Wait for every replica to acknowledge. After success, a read
    /// anywhere in the replica set observes the write.
    All,
}

impl ReplicaAck {
    /// Acknowledgments required for `replicas` configured replicas.
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            ReplicaAck::None => 0,
            ReplicaAck::One => replicas.min(1),
            ReplicaAck::All => replicas,
        }
    }
}

/// The nodes responsible for a key: owner first, then replicas in
/// distance order.
///
/// `candidates` must include every live node under consideration
/// (including the local one). Ties in distance cannot occur between
/// distinct ids under XOR, but the id tie-break keeps the order fully
/// deterministic regardless.
pub fn replica_set(key_id: &NodeId, candidates: &[NodeId], replicas: usize) -> Vec<NodeId> {
    let mut set: Vec<NodeId> = candidates.to_vec();
    set.sort_by_key(|id| (id.distance(key_id), *id));
    set.dedup();
    set.truncate(replicas + 1);
    set
}

/// The single primary owner for a key, if any candidate is live.
pub fn owner_of(key_id: &NodeId, candidates: &[NodeId]) -> Option<NodeId> {
    candidates
        .iter()
        .min_by_key(|id| (id.distance(key_id), **id))
        .copied()
}
