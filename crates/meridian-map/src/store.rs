//! The local slice of one named map.

use std::collections::HashMap;

use meridian_codec::Value;
use meridian_topology::NodeId;
use tracing::trace;

use crate::{MapEntry, Version};

/// Entries this node holds for one named map, keyed by the encoded
/// key bytes.
///
/// The store applies last-writer-wins merges and plans handoff when
/// ownership moves; routing and replication live in the node runtime.
#[derive(Debug, Default)]
pub struct MapStore {
    entries: HashMap<Vec<u8>, MapEntry>,
}

impl MapStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Read a live value. Tombstones read as absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries
            .get(key)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Read the full entry, tombstones included (for replication).
    pub fn entry(&self, key: &[u8]) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Write a value at a version. Returns true if the write was
    /// applied (newer than what was stored).
    pub fn put(&mut self, key: Vec<u8>, value: Value, version: Version) -> bool {
        self.apply(key, MapEntry::new(value, version))
    }

    /// Write a tombstone at a version.
    pub fn delete(&mut self, key: Vec<u8>, version: Version) -> bool {
        self.apply(key, MapEntry::tombstone(version))
    }

    /// Apply a replicated entry with last-writer-wins semantics.
    /// Returns true if the entry was newer and stored.
    pub fn apply(&mut self, key: Vec<u8>, entry: MapEntry) -> bool {
        match self.entries.get_mut(&key) {
            Some(existing) => existing.merge(entry),
            None => {
                self.entries.insert(key, entry);
                true
            }
        }
    }

    /// Drain every entry whose owner is no longer this node, batched
    /// by new owner for handoff streaming.
    ///
    /// `owner_for` maps encoded key bytes to the current owner under
    /// the caller's membership view.
    pub fn drain_not_owned<F>(
        &mut self,
        local: &NodeId,
        mut owner_for: F,
    ) -> HashMap<NodeId, Vec<(Vec<u8>, MapEntry)>>
    where
        F: FnMut(&[u8]) -> Option<NodeId>,
    {
        let moving: Vec<Vec<u8>> = self
            .entries
            .keys()
            .filter(|key| match owner_for(key) {
                Some(owner) => owner != *local,
                None => false,
            })
            .cloned()
            .collect();

        let mut batches: HashMap<NodeId, Vec<(Vec<u8>, MapEntry)>> = HashMap::new();
        for key in moving {
            // Checked non-None above; the owner view is stable within
            // one drain call.
            let owner = owner_for(&key).unwrap();
            let entry = self.entries.remove(&key).unwrap();
            batches.entry(owner).or_default().push((key, entry));
        }

        if !batches.is_empty() {
            trace!(
                targets = batches.len(),
                entries = batches.values().map(Vec::len).sum::<usize>(),
                "planned handoff batches"
            );
        }
        batches
    }

    /// All entries, for a full handoff on graceful leave.
    pub fn drain_all(&mut self) -> Vec<(Vec<u8>, MapEntry)> {
        self.entries.drain().collect()
    }

    /// Iterate over all entries, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &MapEntry)> {
        self.entries.iter()
    }

    /// Remove an entry outright (after it was streamed elsewhere).
    pub fn remove(&mut self, key: &[u8]) -> Option<MapEntry> {
        self.entries.remove(key)
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    #[test]
    fn put_and_get() {
        let mut store = MapStore::new();
        store.put(b"k".to_vec(), "v".into(), Version::at(1, id(1)));
        assert_eq!(store.get(b"k"), Some(&"v".into()));
    }

    #[test]
    fn get_missing_is_none() {
        assert_eq!(MapStore::new().get(b"nope"), None);
    }

    #[test]
    fn delete_hides_value_but_keeps_entry() {
        let mut store = MapStore::new();
        store.put(b"k".to_vec(), "v".into(), Version::at(1, id(1)));
        store.delete(b"k".to_vec(), Version::at(2, id(1)));

        assert_eq!(store.get(b"k"), None);
        assert!(store.entry(b"k").unwrap().is_tombstone());
    }

    #[test]
    fn stale_replica_is_rejected() {
        let mut store = MapStore::new();
        store.put(b"k".to_vec(), "new".into(), Version::at(5, id(1)));

        let applied = store.apply(
            b"k".to_vec(),
            MapEntry::new("old".into(), Version::at(2, id(1))),
        );
        assert!(!applied);
        assert_eq!(store.get(b"k"), Some(&"new".into()));
    }

    #[test]
    fn drain_not_owned_batches_by_owner() {
        let local = id(1);
        let other = id(2);
        let mut store = MapStore::new();
        store.put(b"mine".to_vec(), "a".into(), Version::at(1, local));
        store.put(b"theirs".to_vec(), "b".into(), Version::at(1, local));

        let batches = store.drain_not_owned(&local, |key| {
            if key == b"theirs" {
                Some(other)
            } else {
                Some(local)
            }
        });

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[&other].len(), 1);
        assert_eq!(batches[&other][0].0, b"theirs".to_vec());
        assert_eq!(store.len(), 1);
        assert!(store.get(b"mine").is_some());
    }

    #[test]
    fn drain_all_empties_store() {
        let mut store = MapStore::new();
        store.put(b"a".to_vec(), "1".into(), Version::at(1, id(1)));
        store.put(b"b".to_vec(), "2".into(), Version::at(1, id(1)));

        let drained = store.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(store.is_empty());
    }
}
