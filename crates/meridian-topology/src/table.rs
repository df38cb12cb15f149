//! The bounded-degree routing table.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::id::Distance;
use crate::{NodeId, PeerRecord, BUCKET_CAPACITY, BUCKET_COUNT};

/// Probe failures tolerated before an entry is declared dead.
pub const MAX_PROBE_FAILURES: u8 = 3;

/// Liveness state of a routing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Recently heard from.
    Alive,
    /// Missed at least one probe.
    Suspect,
    /// Exceeded the failure threshold; awaiting purge.
    Dead,
}

/// A peer tracked by the routing table.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    /// Latest gossip record for the peer.
    pub record: PeerRecord,
    /// When the peer was last heard from.
    pub last_seen: Instant,
    /// Current liveness state.
    pub liveness: Liveness,
    /// Consecutive unanswered probes.
    pub failures: u8,
}

impl RoutingEntry {
    fn new(record: PeerRecord) -> Self {
        Self {
            record,
            last_seen: Instant::now(),
            liveness: Liveness::Alive,
            failures: 0,
        }
    }

    /// Whether the entry may be used for routing.
    pub fn is_routable(&self) -> bool {
        self.liveness != Liveness::Dead
    }
}

/// Bounded-degree view of the mesh, bucketed by XOR prefix length.
///
/// Buckets close to the local identifier are sparse in practice, so
/// the table holds `O(log n)` peers for a mesh of `n` nodes while
/// guaranteeing a next hop that strictly decreases XOR distance for
/// any reachable target.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<Vec<RoutingEntry>>,
}

impl RoutingTable {
    /// Create an empty table for the given local identifier.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    /// The local identifier this table routes for.
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        // Equal ids share all 256 bits; clamp into the last bucket.
        (self.local.shared_prefix_bits(id) as usize).min(BUCKET_COUNT - 1)
    }

    /// Observe a peer record from gossip or a direct message.
    ///
    /// Known peers are refreshed (record merge is last-writer-wins and
    /// liveness resets to Alive). Unknown peers are inserted if their
    /// bucket has room, or if the bucket holds an evictable non-alive
    /// entry. Returns true if the table changed.
    pub fn observe(&mut self, record: PeerRecord) -> bool {
        if record.id == self.local {
            return false;
        }
        let index = self.bucket_index(&record.id);
        let bucket = &mut self.buckets[index];

        if let Some(entry) = bucket.iter_mut().find(|e| e.record.id == record.id) {
            let merged = entry.record.merge(record);
            entry.last_seen = Instant::now();
            entry.liveness = Liveness::Alive;
            entry.failures = 0;
            return merged;
        }

        if bucket.len() < BUCKET_CAPACITY {
            trace!(peer = %record.id, bucket = index, "routing table insert");
            bucket.push(RoutingEntry::new(record));
            return true;
        }

        // Full bucket: prefer evicting a dead entry, then the stalest
        // suspect. Alive entries are never displaced by gossip.
        let victim = bucket
            .iter()
            .enumerate()
            .filter(|(_, e)| e.liveness != Liveness::Alive)
            .min_by_key(|(_, e)| (e.liveness == Liveness::Suspect, e.last_seen))
            .map(|(i, _)| i);

        match victim {
            Some(i) => {
                debug!(
                    evicted = %bucket[i].record.id,
                    inserted = %record.id,
                    bucket = index,
                    "evicting non-alive routing entry"
                );
                bucket[i] = RoutingEntry::new(record);
                true
            }
            None => false,
        }
    }

    /// Mark a peer as heard from right now.
    pub fn touch(&mut self, id: &NodeId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.last_seen = Instant::now();
            entry.liveness = Liveness::Alive;
            entry.failures = 0;
        }
    }

    /// Record an unanswered probe.
    ///
    /// Returns the resulting liveness, or None if the peer is unknown.
    pub fn record_failure(&mut self, id: &NodeId) -> Option<Liveness> {
        let entry = self.entry_mut(id)?;
        entry.failures = entry.failures.saturating_add(1);
        entry.liveness = if entry.failures >= MAX_PROBE_FAILURES {
            Liveness::Dead
        } else {
            Liveness::Suspect
        };
        Some(entry.liveness)
    }

    /// Remove a peer outright (graceful leave).
    pub fn remove(&mut self, id: &NodeId) -> Option<RoutingEntry> {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let pos = bucket.iter().position(|e| &e.record.id == id)?;
        Some(bucket.swap_remove(pos))
    }

    /// Drop all dead entries, returning their identifiers.
    ///
    /// The caller is responsible for triggering ownership handoff for
    /// the returned peers.
    pub fn purge_dead(&mut self) -> Vec<NodeId> {
        let mut purged = Vec::new();
        for bucket in &mut self.buckets {
            bucket.retain(|e| {
                if e.liveness == Liveness::Dead {
                    purged.push(e.record.id);
                    false
                } else {
                    true
                }
            });
        }
        if !purged.is_empty() {
            debug!(count = purged.len(), "purged dead peers");
        }
        purged
    }

    /// Look up a single entry.
    pub fn get(&self, id: &NodeId) -> Option<&RoutingEntry> {
        let index = self.bucket_index(id);
        self.buckets[index].iter().find(|e| &e.record.id == id)
    }

    fn entry_mut(&mut self, id: &NodeId) -> Option<&mut RoutingEntry> {
        let index = self.bucket_index(id);
        self.buckets[index].iter_mut().find(|e| &e.record.id == id)
    }

    /// All entries, any liveness.
    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.buckets.iter().flatten()
    }

    /// Identifiers of all routable (non-dead) peers.
    pub fn routable_ids(&self) -> Vec<NodeId> {
        self.entries()
            .filter(|e| e.is_routable())
            .map(|e| e.record.id)
            .collect()
    }

    /// The `k` routable peers closest to `target` in XOR distance.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .entries()
            .filter(|e| e.is_routable())
            .map(|e| e.record.id)
            .collect();
        // Ties in distance break toward the smaller identifier, which
        // keeps ownership deterministic across nodes.
        ids.sort_by_key(|id| (id.distance(target), *id));
        ids.truncate(k);
        ids
    }

    /// Greedy next hop: the routable peer closest to `target` that is
    /// strictly closer than the local node.
    pub fn next_hop(&self, target: &NodeId) -> Option<NodeId> {
        let own = self.local.distance(target);
        let mut best: Option<(NodeId, Distance)> = None;
        for entry in self.entries().filter(|e| e.is_routable()) {
            let dist = entry.record.id.distance(target);
            if dist < own {
                match best {
                    Some((_, best_dist)) if dist >= best_dist => {}
                    _ => best = Some((entry.record.id, dist)),
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// Peers that have been silent past `max_idle` and deserve a probe.
    pub fn due_probe(&self, max_idle: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        self.entries()
            .filter(|e| e.is_routable() && now.duration_since(e.last_seen) > max_idle)
            .map(|e| e.record.id)
            .collect()
    }

    /// The `n` freshest records, for piggybacking on gossip.
    pub fn newest_records(&self, n: usize) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self
            .entries()
            .filter(|e| e.is_routable())
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(n);
        records
    }

    /// Number of tracked peers, any liveness.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Check if no peers are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    fn record(byte: u8) -> PeerRecord {
        PeerRecord::new(id(byte), format!("peer-{byte}"))
    }

    fn table_with(local: u8, peers: &[u8]) -> RoutingTable {
        let mut table = RoutingTable::new(id(local));
        for &p in peers {
            table.observe(record(p));
        }
        table
    }

    #[test]
    fn ignores_local_id() {
        let mut table = RoutingTable::new(id(1));
        assert!(!table.observe(record(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn observe_then_get() {
        let table = table_with(0, &[5]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id(5)).unwrap().record.addr, "peer-5");
    }

    #[test]
    fn closest_orders_by_distance() {
        let table = table_with(0, &[0x10, 0x20, 0x30]);
        let closest = table.closest(&id(0x11), 2);
        assert_eq!(closest[0], id(0x10));
        assert_eq!(closest.len(), 2);
    }

    #[test]
    fn closest_is_deterministic() {
        // a ^ t == b ^ t implies a == b, so distinct peers never tie in
        // XOR distance; the id tie-break only pins down determinism.
        let table = table_with(0, &[0x44, 0x45]);
        let first = table.closest(&id(0x46), 2);
        let second = table.closest(&id(0x46), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn next_hop_strictly_decreases_distance() {
        let table = table_with(0x00, &[0x0f, 0x70, 0x71]);
        let target = id(0x73);
        let hop = table.next_hop(&target).unwrap();
        assert!(hop.distance(&target) < id(0x00).distance(&target));
        assert_eq!(hop, id(0x71));
    }

    #[test]
    fn next_hop_none_when_local_is_closest() {
        let table = table_with(0x70, &[0x0f]);
        // Local 0x70 is closer to 0x71 than peer 0x0f is.
        assert_eq!(table.next_hop(&id(0x71)), None);
    }

    #[test]
    fn failure_escalates_to_dead_and_purges() {
        let mut table = table_with(0, &[9]);

        assert_eq!(table.record_failure(&id(9)), Some(Liveness::Suspect));
        assert_eq!(table.record_failure(&id(9)), Some(Liveness::Suspect));
        assert_eq!(table.record_failure(&id(9)), Some(Liveness::Dead));

        let purged = table.purge_dead();
        assert_eq!(purged, vec![id(9)]);
        assert!(table.is_empty());
    }

    #[test]
    fn touch_resets_failures() {
        let mut table = table_with(0, &[9]);
        table.record_failure(&id(9));
        table.touch(&id(9));

        let entry = table.get(&id(9)).unwrap();
        assert_eq!(entry.liveness, Liveness::Alive);
        assert_eq!(entry.failures, 0);
    }

    #[test]
    fn dead_peers_are_not_routable() {
        let mut table = table_with(0, &[9]);
        for _ in 0..MAX_PROBE_FAILURES {
            table.record_failure(&id(9));
        }
        assert!(table.closest(&id(9), 1).is_empty());
        assert_eq!(table.next_hop(&id(9)), None);
    }

    #[test]
    fn full_bucket_rejects_when_all_alive() {
        let mut table = RoutingTable::new(NodeId([0u8; 32]));
        // All these ids share no prefix bits with local (high bit set),
        // so they land in bucket 0.
        for i in 0..BUCKET_CAPACITY as u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x80 | i;
            assert!(table.observe(PeerRecord::new(NodeId(bytes), "a")));
        }
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80 | BUCKET_CAPACITY as u8;
        assert!(!table.observe(PeerRecord::new(NodeId(bytes), "overflow")));
        assert_eq!(table.len(), BUCKET_CAPACITY);
    }

    #[test]
    fn full_bucket_evicts_dead_first() {
        let mut table = RoutingTable::new(NodeId([0u8; 32]));
        let mut first = [0u8; 32];
        first[0] = 0x80;
        table.observe(PeerRecord::new(NodeId(first), "first"));
        for _ in 0..MAX_PROBE_FAILURES {
            table.record_failure(&NodeId(first));
        }
        for i in 1..BUCKET_CAPACITY as u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = 0x80 | i;
            table.observe(PeerRecord::new(NodeId(bytes), "filler"));
        }

        let mut newcomer = [0u8; 32];
        newcomer[0] = 0x80 | BUCKET_CAPACITY as u8;
        assert!(table.observe(PeerRecord::new(NodeId(newcomer), "new")));
        assert!(table.get(&NodeId(first)).is_none());
        assert!(table.get(&NodeId(newcomer)).is_some());
    }

    #[test]
    fn greedy_routing_terminates() {
        // Random-ish mesh: every node knows a slice of the others.
        let ids: Vec<NodeId> = (0u8..50).map(|i| NodeId::derive(&[i])).collect();
        let tables: Vec<RoutingTable> = ids
            .iter()
            .map(|&local| {
                let mut t = RoutingTable::new(local);
                for &peer in &ids {
                    t.observe(PeerRecord::new(peer, "sim"));
                }
                t
            })
            .collect();

        let target = ids[37];
        let mut current = 0usize;
        let mut hops = 0;
        while ids[current] != target {
            let next = tables[current]
                .next_hop(&target)
                .expect("greedy step must exist while not at target");
            current = ids.iter().position(|&i| i == next).unwrap();
            hops += 1;
            assert!(hops <= 256, "routing did not terminate");
        }
        assert!(hops <= 10, "took {hops} hops for 50 nodes");
    }
}
