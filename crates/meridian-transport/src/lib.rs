//! Meridian Transport
//!
//! The opaque message-passing substrate between peers. The core only
//! requires `send(peer, bytes)` and a stream of `(peer, bytes)`
//! arrivals; delivery may be unreliable and unordered across peers,
//! but each peer link preserves FIFO order.
//!
//! Two implementations:
//! - [`UdpTransport`]: datagrams over UDP with configurable socket
//!   buffers, for real deployments.
//! - [`HubTransport`]: an in-memory hub for tests and simulation, with
//!   optional seeded packet loss.

mod datagram;
mod hub;

pub use datagram::{UdpTransport, UdpTransportConfig};
pub use hub::{Hub, HubTransport};

use bytes::Bytes;
use meridian_topology::NodeId;
use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer has no known address binding.
    #[error("no address binding for peer {0}")]
    Unbound(NodeId),

    /// The address could not be parsed by this transport.
    #[error("bad address {addr:?}")]
    BadAddress { addr: String },

    /// The underlying socket or channel failed.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// A bidirectional datagram endpoint addressed by [`NodeId`].
///
/// Implementations resolve identifiers to concrete addresses through
/// [`bind_peer`](Transport::bind_peer) calls made by the topology layer
/// as it learns addresses from gossip.
pub trait Transport: Send + Sync + 'static {
    /// Send one opaque message to a peer. Best effort; an `Ok` return
    /// means the message was handed to the substrate, not delivered.
    fn send(
        &self,
        peer: NodeId,
        payload: Bytes,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Send one opaque message to a raw address, before the peer's
    /// identifier is known. Used once, at seed bootstrap; the seed's
    /// reply arrives through [`recv`](Transport::recv) with its
    /// identifier attached.
    fn send_to_addr(
        &self,
        addr: &str,
        payload: Bytes,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Receive the next incoming message. Returns `None` once the
    /// transport is closed. Takes `&self` so an event loop can hold a
    /// pending receive while sending from other select arms.
    fn recv(&self) -> impl std::future::Future<Output = Option<(NodeId, Bytes)>> + Send;

    /// Associate a peer identifier with an opaque address string.
    fn bind_peer(&self, peer: NodeId, addr: &str) -> Result<()>;

    /// The local address other peers should bind for this endpoint.
    fn local_addr(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_peer() {
        let id = NodeId::derive(b"x");
        let msg = TransportError::Unbound(id).to_string();
        assert!(msg.contains(&id.to_string()));
    }
}
