//! Local subscription registry.

use std::collections::HashMap;

use meridian_codec::Value;
use tracing::trace;

use crate::Circle;

/// Opaque handle for one registered subscription.
///
/// Callbacks live behind integer handles rather than raw pointers, so
/// bindings can pass the handle across any boundary safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// A delivery callback. Invoked from the node's event loop; keep it
/// short and hand heavy work to a channel.
pub type Callback = Box<dyn FnMut(Value) + Send + Sync>;

struct LocalSub {
    id: SubscriptionId,
    circle: Circle,
    callback: Callback,
}

/// All subscriptions registered on the local node for one pub/sub
/// channel, indexed by topic.
#[derive(Default)]
pub struct SubscriptionTable {
    next_id: u64,
    by_topic: HashMap<String, Vec<LocalSub>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            by_topic: HashMap::new(),
        }
    }

    /// Register a callback for a topic within a circle.
    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        circle: Circle,
        callback: Callback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let topic = topic.into();
        trace!(topic = %topic, id = id.0, "subscribe");
        self.by_topic
            .entry(topic)
            .or_default()
            .push(LocalSub { id, circle, callback });
        id
    }

    /// Drop every subscription for a topic. Returns how many were
    /// removed.
    pub fn unsubscribe_topic(&mut self, topic: &str) -> usize {
        self.by_topic.remove(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Drop a single subscription by handle.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for subs in self.by_topic.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver a publish to every matching subscription, invoking the
    /// callbacks. Returns the number of deliveries.
    pub fn deliver(&mut self, topic: &str, publish: &Circle, value: &Value) -> usize {
        let Some(subs) = self.by_topic.get_mut(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for sub in subs.iter_mut() {
            if publish.intersects(&sub.circle) {
                (sub.callback)(value.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// The enclosing coverage circle for a topic, if any subscription
    /// exists. This is what gets gossiped.
    pub fn coverage(&self, topic: &str) -> Option<Circle> {
        let subs = self.by_topic.get(topic)?;
        let circles: Vec<Circle> = subs.iter().map(|s| s.circle).collect();
        Circle::enclosing(&circles)
    }

    /// Topics with at least one subscription.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(topic, _)| topic.as_str())
    }

    /// Total number of subscriptions across topics.
    pub fn len(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum()
    }

    /// Check for no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
