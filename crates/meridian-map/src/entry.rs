//! Versioned map entries with last-writer-wins merge.

use meridian_codec::Value;
use meridian_topology::{unix_millis, NodeId};
use serde::{Deserialize, Serialize};

/// Write version: wall-clock timestamp with the writer's id as
/// tie-break. Ordering is derived field order, so equal timestamps
/// resolve toward the larger writer id deterministically on every
/// replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    /// Unix millis at the writing node.
    pub timestamp: u64,
    /// The node that produced the write.
    pub writer: NodeId,
}

impl Version {
    /// Stamp a version with the current time.
    pub fn now(writer: NodeId) -> Self {
        Self {
            timestamp: unix_millis(),
            writer,
        }
    }

    /// A version with an explicit timestamp.
    pub const fn at(timestamp: u64, writer: NodeId) -> Self {
        Self { timestamp, writer }
    }
}

/// A map entry: a value (or tombstone) plus its write version.
///
/// Deletes are written as tombstones so they replicate and compete
/// with concurrent writes under the same last-writer-wins rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    /// The stored value; `None` marks a tombstone.
    pub value: Option<Value>,
    /// The write that produced this state.
    pub version: Version,
}

impl MapEntry {
    /// A live entry.
    pub fn new(value: Value, version: Version) -> Self {
        Self {
            value: Some(value),
            version,
        }
    }

    /// A tombstone.
    pub fn tombstone(version: Version) -> Self {
        Self {
            value: None,
            version,
        }
    }

    /// Check for a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Check if this entry's write is newer than another's.
    pub fn is_newer_than(&self, other: &MapEntry) -> bool {
        self.version > other.version
    }

    /// Merge with another entry for the same key, keeping the newer
    /// write. Returns true if self was updated.
    pub fn merge(&mut self, other: MapEntry) -> bool {
        if other.is_newer_than(self) {
            *self = other;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    #[test]
    fn newer_timestamp_wins() {
        let mut entry = MapEntry::new("old".into(), Version::at(100, id(1)));
        let newer = MapEntry::new("new".into(), Version::at(200, id(1)));

        assert!(entry.merge(newer));
        assert_eq!(entry.value, Some("new".into()));
    }

    #[test]
    fn older_write_is_ignored() {
        let mut entry = MapEntry::new("new".into(), Version::at(200, id(1)));
        assert!(!entry.merge(MapEntry::new("old".into(), Version::at(100, id(1)))));
        assert_eq!(entry.value, Some("new".into()));
    }

    #[test]
    fn equal_timestamp_breaks_by_writer_id() {
        let mut entry = MapEntry::new("low".into(), Version::at(100, id(1)));
        let high = MapEntry::new("high".into(), Version::at(100, id(2)));

        assert!(entry.merge(high.clone()));
        assert_eq!(entry.value, Some("high".into()));

        // And the reverse direction does not flap.
        let mut entry = high;
        assert!(!entry.merge(MapEntry::new("low".into(), Version::at(100, id(1)))));
        assert_eq!(entry.value, Some("high".into()));
    }

    #[test]
    fn tombstone_beats_older_write() {
        let mut entry = MapEntry::new("alive".into(), Version::at(100, id(1)));
        assert!(entry.merge(MapEntry::tombstone(Version::at(200, id(1)))));
        assert!(entry.is_tombstone());
    }

    #[test]
    fn newer_write_resurrects_tombstone() {
        let mut entry = MapEntry::tombstone(Version::at(100, id(1)));
        assert!(entry.merge(MapEntry::new("back".into(), Version::at(200, id(1)))));
        assert!(!entry.is_tombstone());
    }
}
