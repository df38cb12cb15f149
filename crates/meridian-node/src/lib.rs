//! Meridian Node Runtime
//!
//! Ties the mesh layers together into a running node with an
//! application-facing [`Session`]:
//!
//! ```text
//! application
//!     │  access_map("name") / access_pubsub("name")
//!     ▼
//! Session ── commands ──► event loop (node.rs)
//!                             │ owns: routing table, map stores,
//!                             │       subscriptions, coverage
//!                             ▼
//!                         Transport ──► remote peers
//! ```
//!
//! One tokio task per node; no shared-memory state across nodes. See
//! the crate-level docs of `meridian-topology`, `meridian-map` and
//! `meridian-pubsub` for the layer semantics.

mod config;
mod error;
mod node;
mod proto;
mod session;

pub use config::NodeConfig;
pub use error::{ConnectError, Error, Result};
pub use node::Lifecycle;
pub use session::{MapHandle, PubSubHandle, Session};

// The value and option types callers interact with.
pub use meridian_codec::Value;
pub use meridian_map::{MapError, ReplicaAck};
pub use meridian_pubsub::{PubSubError, PublishOptions, SubscriptionId};
pub use meridian_topology::{NodeId, NODE_ID_LEN};
