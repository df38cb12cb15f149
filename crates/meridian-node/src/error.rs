//! Error types for the node runtime.

use thiserror::Error;

/// Result type for session-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while establishing a session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    /// Every configured seed was tried and none answered or accepted.
    /// Fatal to the local node only: nothing was joined.
    #[error("all {tried} seed addresses exhausted")]
    SeedsExhausted { tried: usize },

    /// A seed answered but rejected the presented token.
    #[error("seed rejected the authentication token")]
    AuthRejected,

    /// The transport failed before any seed could be reached.
    #[error("transport failure during join: {0}")]
    Transport(String),
}

/// Errors surfaced by session-level operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Joining the mesh failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A map operation failed.
    #[error(transparent)]
    Map(#[from] meridian_map::MapError),

    /// A pub/sub operation failed.
    #[error(transparent)]
    PubSub(#[from] meridian_pubsub::PubSubError),

    /// A message could not be routed.
    #[error(transparent)]
    Route(#[from] meridian_topology::RouteError),

    /// A value failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] meridian_codec::CodecError),

    /// The session has been disconnected.
    #[error("session closed")]
    Closed,
}
