//! Shared helpers for multi-node mesh scenarios.
//!
//! Tests live in `tests/`; everything here builds small meshes over
//! the in-memory hub transport with aggressive timers.

use std::time::Duration;

use meridian_codec::Value;
use meridian_map::replica_set;
use meridian_node::{NodeConfig, NodeId, Session};
use meridian_transport::{Hub, Transport};

/// How long tests wait for gossip to settle on small meshes.
pub const SETTLE: Duration = Duration::from_millis(600);

/// Deterministic node id for mesh member `i`.
pub fn member_id(i: u8) -> NodeId {
    NodeId::derive(&[b'm', b'e', b'm', i])
}

/// Spawn an `n`-node mesh on `hub`: member 0 starts fresh, the rest
/// join through it as their seed.
pub async fn spawn_mesh(hub: &Hub, n: u8, config: NodeConfig) -> Vec<Session> {
    assert!(n >= 1);
    let mut sessions = Vec::with_capacity(n as usize);

    let first_id = member_id(0);
    let first_transport = hub.attach(first_id);
    let seed_addr = first_transport.local_addr();
    let first = Session::connect(first_id, first_transport, config.clone())
        .await
        .expect("first member starts fresh");
    sessions.push(first);

    for i in 1..n {
        let id = member_id(i);
        let transport = hub.attach(id);
        let session = Session::connect(
            id,
            transport,
            config.clone().with_seeds([seed_addr.clone()]),
        )
        .await
        .expect("member joins through seed");
        sessions.push(session);
    }

    sessions
}

/// The key-space point a map key routes to.
pub fn key_point(map: &str, key: &str) -> NodeId {
    let encoded = meridian_codec::encode(&Value::from(key));
    NodeId::for_key(map, &encoded)
}

/// Find a key string (by numeric suffix) whose owner under the given
/// membership satisfies `accept(owner, replica_set)`.
pub fn find_key<F>(map: &str, members: &[NodeId], replicas: usize, accept: F) -> String
where
    F: Fn(NodeId, &[NodeId]) -> bool,
{
    for i in 0..10_000u32 {
        let key = format!("key-{i}");
        let set = replica_set(&key_point(map, &key), members, replicas);
        if accept(set[0], &set) {
            return key;
        }
    }
    panic!("no key satisfied the ownership predicate");
}

/// The seedable address of mesh member `i` on a hub.
pub fn member_addr(i: u8) -> String {
    format!("mem://{}", member_id(i).to_hex())
}
