//! Wire protocol between mesh nodes.
//!
//! Messages are bincode-framed enums. Map requests carry a routing
//! point in ID space and hop greedily toward it; everything else is
//! sent directly to a known peer.

use bytes::Bytes;
use meridian_codec::Value;
use meridian_map::{MapEntry, ReplicaAck, Version};
use meridian_pubsub::{Circle, CoverageSummary};
use meridian_topology::{NodeId, PeerRecord};
use serde::{Deserialize, Serialize};

/// A map operation as it travels through the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MapRequest {
    /// Read a key.
    Get { map: String, key: Vec<u8> },
    /// Write a key. The owner applies it and fans out replication.
    Set {
        map: String,
        key: Vec<u8>,
        value: Value,
        version: Version,
        ack: ReplicaAck,
    },
    /// Delete a key (tombstone write).
    Delete {
        map: String,
        key: Vec<u8>,
        version: Version,
    },
    /// Owner-to-replica copy of an entry. Applied unconditionally
    /// under last-writer-wins.
    Replicate {
        map: String,
        key: Vec<u8>,
        entry: MapEntry,
    },
}

/// The answer to a [`MapRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MapResponse {
    /// A live value.
    Value(Value),
    /// No live value for the key.
    NotFound,
    /// Write applied (and acknowledged as requested).
    Ok,
    /// The handling node does not consider itself the owner.
    OwnershipConflict { believed_owner: NodeId },
}

/// Everything that crosses the wire between two mesh nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask a seed to admit this node.
    Join {
        record: PeerRecord,
        token: Option<String>,
    },
    /// Seed's answer, with a bounded peer sample on acceptance.
    JoinAck {
        accepted: bool,
        records: Vec<PeerRecord>,
    },
    /// Graceful departure announcement.
    Leave { id: NodeId },

    /// Liveness probe.
    Ping { nonce: u64 },
    /// Probe answer.
    Pong { nonce: u64 },

    /// Periodic membership + coverage exchange. Coverage entries are
    /// (channel, subscribing node, summary) and include third-party
    /// knowledge, so coverage spreads transitively like peer records.
    Gossip {
        records: Vec<PeerRecord>,
        coverage: Vec<(String, NodeId, CoverageSummary)>,
    },

    /// A key-routed map request. Forwarded greedily toward `key`
    /// until the handling node is the closest it knows, or `ttl`
    /// runs out.
    Request {
        req_id: u64,
        from: NodeId,
        key: NodeId,
        ttl: u8,
        request: MapRequest,
    },
    /// Answer to a [`Message::Request`], sent straight back.
    Response { req_id: u64, response: MapResponse },

    /// Ownership handoff: entries streamed to their new owner.
    Handoff {
        map: String,
        batch: Vec<(Vec<u8>, MapEntry)>,
    },

    /// A geospatially routed publish.
    Publish {
        channel: String,
        topic: String,
        circle: Circle,
        value: Value,
        publisher: NodeId,
        seq: u64,
        ack: bool,
    },
    /// Receipt for an acknowledged publish.
    PublishAck { publisher: NodeId, seq: u64 },
}

impl Message {
    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(bincode::serialize(self).unwrap_or_default())
    }

    /// Deserialize from the wire. `None` for garbage: the mesh drops
    /// undecodable datagrams rather than failing the loop.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}
