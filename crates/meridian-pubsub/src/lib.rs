//! Meridian Geospatial Pub/Sub
//!
//! The 2D publish/subscribe layer. Subscriptions register a circle
//! (position + radius) per topic; a publish at (x, y, r) reaches
//! exactly the subscriptions whose circle intersects the publish
//! circle: distance between centers ≤ sum of radii.
//!
//! # Distributed matching
//!
//! Publishing is not a broadcast. Each node condenses its local
//! subscriptions per topic into one enclosing *coverage circle* and
//! gossips it with its peer record. A publisher intersects the publish
//! circle against every known coverage circle and unicasts to the
//! matching nodes only; the receiving node then applies the exact
//! per-subscription rule. Coverage is a superset of its subscriptions,
//! so no matching subscriber is missed once gossip has propagated.

mod coverage;
mod dedup;
mod geometry;
mod subscription;

pub use coverage::{CoverageIndex, CoverageSummary};
pub use dedup::DedupWindow;
pub use geometry::Circle;
pub use subscription::{Callback, SubscriptionId, SubscriptionTable};

use thiserror::Error;

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors surfaced by pub/sub operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PubSubError {
    /// The radius is negative or not finite.
    #[error("invalid region: radius {radius}")]
    InvalidRegion { radius: f64 },

    /// The publish could not be routed toward a covered node.
    #[error(transparent)]
    Route(#[from] meridian_topology::RouteError),

    /// An acknowledged publish did not collect its acks in time.
    #[error("publish timed out awaiting acknowledgment")]
    Timeout,
}

/// Options for a publish call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Request acknowledgment-based at-least-once delivery. Receivers
    /// deduplicate by (publisher, sequence number), so redelivery is
    /// idempotent.
    pub ack: bool,
}

impl PublishOptions {
    /// Default at-most-once delivery.
    pub fn fire_and_forget() -> Self {
        Self { ack: false }
    }

    /// Acknowledged at-least-once delivery.
    pub fn acknowledged() -> Self {
        Self { ack: true }
    }
}
