//! Remote coverage tracking.
//!
//! Each node gossips one coverage circle per topic it subscribes to.
//! The index stores the latest circle per (node, topic) and answers
//! the publisher's question: which nodes might have a matching
//! subscription for this publish?

use std::collections::HashMap;

use meridian_topology::{unix_millis, NodeId};
use serde::{Deserialize, Serialize};

use crate::Circle;

/// One node's gossiped coverage for one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Topic name.
    pub topic: String,
    /// Enclosing circle over the node's subscriptions, or `None` when
    /// the node dropped its last subscription for the topic.
    pub circle: Option<Circle>,
    /// When the summary was produced (unix millis).
    pub timestamp: u64,
}

impl CoverageSummary {
    /// A summary stamped with the current time.
    pub fn new(topic: impl Into<String>, circle: Option<Circle>) -> Self {
        Self {
            topic: topic.into(),
            circle,
            timestamp: unix_millis(),
        }
    }
}

#[derive(Debug, Clone)]
struct CoverageEntry {
    circle: Option<Circle>,
    timestamp: u64,
}

/// Last-writer-wins index of remote coverage circles.
#[derive(Debug, Default)]
pub struct CoverageIndex {
    by_node: HashMap<NodeId, HashMap<String, CoverageEntry>>,
}

impl CoverageIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            by_node: HashMap::new(),
        }
    }

    /// Merge gossiped summaries from a node. Older summaries never
    /// overwrite newer knowledge. Returns the number of applied
    /// updates.
    pub fn merge(&mut self, node: NodeId, summaries: &[CoverageSummary]) -> usize {
        let topics = self.by_node.entry(node).or_default();
        let mut applied = 0;
        for summary in summaries {
            let fresh = match topics.get(&summary.topic) {
                Some(existing) => summary.timestamp > existing.timestamp,
                None => true,
            };
            if fresh {
                topics.insert(
                    summary.topic.clone(),
                    CoverageEntry {
                        circle: summary.circle,
                        timestamp: summary.timestamp,
                    },
                );
                applied += 1;
            }
        }
        applied
    }

    /// Forget everything about a node (it left or died).
    pub fn remove_node(&mut self, node: &NodeId) {
        self.by_node.remove(node);
    }

    /// Nodes whose coverage for `topic` intersects the publish circle.
    pub fn matching_nodes(&self, topic: &str, publish: &Circle) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .by_node
            .iter()
            .filter(|(_, topics)| {
                topics
                    .get(topic)
                    .and_then(|entry| entry.circle)
                    .is_some_and(|circle| publish.intersects(&circle))
            })
            .map(|(node, _)| *node)
            .collect();
        nodes.sort();
        nodes
    }

    /// Everything the index knows, as re-gossipable summaries. This is
    /// how coverage propagates transitively beyond direct gossip
    /// partners.
    pub fn snapshot(&self) -> Vec<(NodeId, CoverageSummary)> {
        self.by_node
            .iter()
            .flat_map(|(node, topics)| {
                topics.iter().map(|(topic, entry)| {
                    (
                        *node,
                        CoverageSummary {
                            topic: topic.clone(),
                            circle: entry.circle,
                            timestamp: entry.timestamp,
                        },
                    )
                })
            })
            .collect()
    }

    /// Number of nodes with any known coverage.
    pub fn node_count(&self) -> usize {
        self.by_node.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    fn summary(topic: &str, circle: Option<Circle>, timestamp: u64) -> CoverageSummary {
        CoverageSummary {
            topic: topic.into(),
            circle,
            timestamp,
        }
    }

    #[test]
    fn merge_then_match() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::new(10.0, 0.0, 6.0).unwrap()), 1)],
        );

        let publish = Circle::new(0.0, 0.0, 5.0).unwrap();
        assert_eq!(index.matching_nodes("t", &publish), vec![id(1)]);
    }

    #[test]
    fn narrow_coverage_does_not_match() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::new(10.0, 0.0, 4.0).unwrap()), 1)],
        );

        let publish = Circle::new(0.0, 0.0, 5.0).unwrap();
        assert!(index.matching_nodes("t", &publish).is_empty());
    }

    #[test]
    fn stale_summary_ignored() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::point(0.0, 0.0)), 100)],
        );
        // A stale retraction must not clobber the newer circle.
        let applied = index.merge(id(1), &[summary("t", None, 50)]);
        assert_eq!(applied, 0);
        assert_eq!(
            index.matching_nodes("t", &Circle::point(0.0, 0.0)),
            vec![id(1)]
        );
    }

    #[test]
    fn retraction_clears_coverage() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::point(0.0, 0.0)), 100)],
        );
        index.merge(id(1), &[summary("t", None, 200)]);
        assert!(index
            .matching_nodes("t", &Circle::point(0.0, 0.0))
            .is_empty());
    }

    #[test]
    fn remove_node_forgets_coverage() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::point(0.0, 0.0)), 100)],
        );
        index.remove_node(&id(1));
        assert_eq!(index.node_count(), 0);
        assert!(index
            .matching_nodes("t", &Circle::point(0.0, 0.0))
            .is_empty());
    }

    #[test]
    fn snapshot_roundtrips_through_merge() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("t", Some(Circle::new(1.0, 2.0, 3.0).unwrap()), 100)],
        );

        let mut other = CoverageIndex::new();
        for (node, s) in index.snapshot() {
            other.merge(node, &[s]);
        }
        assert_eq!(
            other.matching_nodes("t", &Circle::point(1.0, 2.0)),
            vec![id(1)]
        );
    }

    #[test]
    fn topics_are_independent() {
        let mut index = CoverageIndex::new();
        index.merge(
            id(1),
            &[summary("a", Some(Circle::point(0.0, 0.0)), 100)],
        );
        assert!(index
            .matching_nodes("b", &Circle::point(0.0, 0.0))
            .is_empty());
    }
}
