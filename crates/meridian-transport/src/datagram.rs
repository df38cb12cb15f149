//! UDP datagram transport
//!
//! A thin wrapper around tokio's UdpSocket with:
//! - Configurable send/receive buffer sizes
//! - Sender identification by a 32-byte id prefix on each datagram
//! - An address binding table fed by the topology layer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use meridian_topology::{NodeId, NODE_ID_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::{Result, Transport, TransportError};

/// Largest datagram this transport will send or accept.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9800".parse().unwrap(),
            sndbuf: 4 * 1024 * 1024, // 4MB
            rcvbuf: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Datagram transport over UDP.
///
/// Each datagram is framed as the sender's 32-byte identifier followed
/// by the opaque payload, so the receiver can attribute messages
/// without a reverse address table.
pub struct UdpTransport {
    local_id: NodeId,
    socket: Arc<UdpSocket>,
    bindings: Arc<RwLock<HashMap<NodeId, SocketAddr>>>,
    // Tokio mutex: held across recv_from await points.
    recv_buf: tokio::sync::Mutex<Vec<u8>>,
}

impl UdpTransport {
    /// Bind to the configured address with the configured buffer sizes.
    pub async fn bind(local_id: NodeId, cfg: UdpTransportConfig) -> anyhow::Result<Self> {
        let domain = if cfg.bind.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Set buffer sizes before binding
        socket.set_send_buffer_size(cfg.sndbuf)?;
        socket.set_recv_buffer_size(cfg.rcvbuf)?;
        socket.set_reuse_address(true)?;

        socket.bind(&cfg.bind.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;

        tracing::info!(
            "UDP transport bound to {} (sndbuf={}, rcvbuf={})",
            tokio_socket.local_addr()?,
            cfg.sndbuf,
            cfg.rcvbuf
        );

        Ok(Self {
            local_id,
            socket: Arc::new(tokio_socket),
            bindings: Arc::new(RwLock::new(HashMap::new())),
            recv_buf: tokio::sync::Mutex::new(vec![0u8; MAX_DATAGRAM]),
        })
    }

    fn resolve(&self, peer: &NodeId) -> Result<SocketAddr> {
        self.bindings
            .read()
            .unwrap()
            .get(peer)
            .copied()
            .ok_or(TransportError::Unbound(*peer))
    }
}

impl Transport for UdpTransport {
    async fn send(&self, peer: NodeId, payload: Bytes) -> Result<()> {
        let addr = self.resolve(&peer)?;

        let mut frame = Vec::with_capacity(NODE_ID_LEN + payload.len());
        frame.extend_from_slice(self.local_id.as_bytes());
        frame.extend_from_slice(&payload);

        self.socket.send_to(&frame, addr).await?;
        trace!(peer = %peer, bytes = payload.len(), "udp send");
        Ok(())
    }

    async fn send_to_addr(&self, addr: &str, payload: Bytes) -> Result<()> {
        let parsed: SocketAddr = addr.parse().map_err(|_| TransportError::BadAddress {
            addr: addr.to_owned(),
        })?;

        let mut frame = Vec::with_capacity(NODE_ID_LEN + payload.len());
        frame.extend_from_slice(self.local_id.as_bytes());
        frame.extend_from_slice(&payload);

        self.socket.send_to(&frame, parsed).await?;
        Ok(())
    }

    async fn recv(&self) -> Option<(NodeId, Bytes)> {
        let mut buf = self.recv_buf.lock().await;
        loop {
            let (len, from) = match self.socket.recv_from(buf.as_mut_slice()).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                    return None;
                }
            };

            if len < NODE_ID_LEN {
                trace!(from = %from, len, "dropping short datagram");
                continue;
            }

            let mut id = [0u8; NODE_ID_LEN];
            id.copy_from_slice(&buf[..NODE_ID_LEN]);
            let sender = NodeId::from_bytes(id);

            // Datagram origin doubles as an address observation; this
            // lets replies flow before gossip has delivered a record.
            self.bindings.write().unwrap().entry(sender).or_insert(from);

            let payload = Bytes::copy_from_slice(&buf[NODE_ID_LEN..len]);
            return Some((sender, payload));
        }
    }

    fn bind_peer(&self, peer: NodeId, addr: &str) -> Result<()> {
        let parsed: SocketAddr = addr.parse().map_err(|_| TransportError::BadAddress {
            addr: addr.to_owned(),
        })?;
        self.bindings.write().unwrap().insert(peer, parsed);
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> UdpTransportConfig {
        UdpTransportConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bind_assigns_port() {
        let t = UdpTransport::bind(NodeId::derive(b"a"), cfg()).await.unwrap();
        assert!(!t.local_addr().is_empty());
        assert!(t.local_addr().contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn send_recv_attributes_sender() {
        let a_id = NodeId::derive(b"a");
        let b_id = NodeId::derive(b"b");

        let a = UdpTransport::bind(a_id, cfg()).await.unwrap();
        let b = UdpTransport::bind(b_id, cfg()).await.unwrap();

        a.bind_peer(b_id, &b.local_addr()).unwrap();
        a.send(b_id, Bytes::from_static(b"hello")).await.unwrap();

        let (from, payload) = b.recv().await.unwrap();
        assert_eq!(from, a_id);
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn recv_learns_reply_address() {
        let a_id = NodeId::derive(b"a");
        let b_id = NodeId::derive(b"b");

        let a = UdpTransport::bind(a_id, cfg()).await.unwrap();
        let b = UdpTransport::bind(b_id, cfg()).await.unwrap();

        a.bind_peer(b_id, &b.local_addr()).unwrap();
        a.send(b_id, Bytes::from_static(b"ping")).await.unwrap();
        let _ = b.recv().await.unwrap();

        // b never called bind_peer for a, yet can reply.
        b.send(a_id, Bytes::from_static(b"pong")).await.unwrap();
    }

    #[tokio::test]
    async fn unbound_peer_is_an_error() {
        let a = UdpTransport::bind(NodeId::derive(b"a"), cfg()).await.unwrap();
        let err = a
            .send(NodeId::derive(b"stranger"), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unbound(_)));
    }

    #[tokio::test]
    async fn bad_address_rejected() {
        let a = UdpTransport::bind(NodeId::derive(b"a"), cfg()).await.unwrap();
        let err = a
            .bind_peer(NodeId::derive(b"b"), "not-an-address")
            .unwrap_err();
        assert!(matches!(err, TransportError::BadAddress { .. }));
    }
}
