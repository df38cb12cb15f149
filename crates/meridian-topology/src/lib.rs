//! Meridian Mesh Topology
//!
//! Node identity and the bounded-degree overlay that every other layer
//! routes through.
//!
//! # ID Space
//!
//! Node identifiers are 32-byte values ordered as big-endian integers.
//! Distance between two identifiers is their bitwise XOR, compared as a
//! big-endian integer. Routing keeps peers in 256 buckets indexed by
//! the length of the shared prefix with the local identifier, bounded
//! to [`BUCKET_CAPACITY`] entries each, which yields logarithmic lookup
//! hops on random topologies.
//!
//! # Liveness
//!
//! Each routing entry tracks when the peer was last heard from. Probes
//! that go unanswered escalate the entry Alive → Suspect → Dead; dead
//! entries are purged and ownership of map entries moves to the next
//! closest live node.

mod id;
mod peer;
mod table;

pub use id::{Distance, NodeId, NODE_ID_LEN};
pub use peer::{unix_millis, PeerRecord};
pub use table::{Liveness, RoutingEntry, RoutingTable};

use thiserror::Error;

/// Maximum live entries per routing bucket.
pub const BUCKET_CAPACITY: usize = 16;

/// Number of routing buckets (one per possible shared-prefix length).
pub const BUCKET_COUNT: usize = NODE_ID_LEN * 8;

/// Errors raised while routing a message through the mesh.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No live peer is closer to the target than the local node.
    #[error("no route toward {0}")]
    NoPath(NodeId),

    /// The target (or every replica of it) is known but unreachable.
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_count_covers_id_space() {
        assert_eq!(BUCKET_COUNT, 256);
    }
}
