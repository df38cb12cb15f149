//! In-memory hub transport for tests and simulation.
//!
//! A shared [`Hub`] broker routes messages between [`HubTransport`]
//! endpoints through per-peer mpsc channels, preserving FIFO order per
//! link. Optional seeded packet loss makes delivery unreliable in a
//! reproducible way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use meridian_topology::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Result, Transport, TransportError};

const ENDPOINT_QUEUE: usize = 256;

struct HubInner {
    peers: Mutex<HashMap<NodeId, mpsc::Sender<(NodeId, Bytes)>>>,
    loss: Option<Mutex<LossModel>>,
}

struct LossModel {
    rate: f64,
    rng: StdRng,
}

/// Shared in-memory network broker.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// A hub with perfect delivery.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                peers: Mutex::new(HashMap::new()),
                loss: None,
            }),
        }
    }

    /// A hub that drops each message with probability `rate`, using a
    /// seeded generator so failures reproduce.
    pub fn with_loss(rate: f64, seed: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                peers: Mutex::new(HashMap::new()),
                loss: Some(Mutex::new(LossModel {
                    rate,
                    rng: StdRng::seed_from_u64(seed),
                })),
            }),
        }
    }

    /// Attach a new endpoint for `id`.
    pub fn attach(&self, id: NodeId) -> HubTransport {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.inner.peers.lock().unwrap().insert(id, tx);
        HubTransport {
            id,
            hub: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Detach an endpoint, simulating an abrupt crash: messages to the
    /// peer are silently dropped from now on.
    pub fn detach(&self, id: &NodeId) {
        self.inner.peers.lock().unwrap().remove(id);
    }

    fn should_drop(&self) -> bool {
        match &self.inner.loss {
            Some(model) => {
                let mut model = model.lock().unwrap();
                let rate = model.rate;
                model.rng.gen_bool(rate)
            }
            None => false,
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint on a [`Hub`].
pub struct HubTransport {
    id: NodeId,
    hub: Hub,
    // Tokio mutex: held across the recv await point so `recv` can
    // take `&self`.
    rx: tokio::sync::Mutex<mpsc::Receiver<(NodeId, Bytes)>>,
}

impl Transport for HubTransport {
    async fn send(&self, peer: NodeId, payload: Bytes) -> Result<()> {
        if self.hub.should_drop() {
            trace!(peer = %peer, "hub dropped message");
            return Ok(());
        }

        let tx = {
            let peers = self.hub.inner.peers.lock().unwrap();
            // A detached sender is partitioned in both directions, so
            // tests can crash a node whose task is still running.
            if !peers.contains_key(&self.id) {
                return Ok(());
            }
            peers.get(&peer).cloned()
        };

        match tx {
            // A detached (crashed) peer behaves like a black hole, the
            // same as an unreachable host on a real network.
            None => Ok(()),
            Some(tx) => {
                let _ = tx.send((self.id, payload)).await;
                Ok(())
            }
        }
    }

    async fn send_to_addr(&self, addr: &str, payload: Bytes) -> Result<()> {
        let hexpart = addr
            .strip_prefix("mem://")
            .ok_or_else(|| TransportError::BadAddress {
                addr: addr.to_owned(),
            })?;
        let peer = NodeId::from_hex(hexpart).map_err(|_| TransportError::BadAddress {
            addr: addr.to_owned(),
        })?;
        self.send(peer, payload).await
    }

    async fn recv(&self) -> Option<(NodeId, Bytes)> {
        self.rx.lock().await.recv().await
    }

    fn bind_peer(&self, _peer: NodeId, _addr: &str) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> String {
        format!("mem://{}", self.id.to_hex())
    }
}

impl HubTransport {
    /// The identifier this endpoint was attached as.
    pub fn id(&self) -> NodeId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_between_endpoints() {
        let hub = Hub::new();
        let a = hub.attach(NodeId::derive(b"a"));
        let b = hub.attach(NodeId::derive(b"b"));

        a.send(b.id(), Bytes::from_static(b"hi")).await.unwrap();

        let (from, payload) = b.recv().await.unwrap();
        assert_eq!(from, a.id());
        assert_eq!(&payload[..], b"hi");
    }

    #[tokio::test]
    async fn preserves_fifo_per_link() {
        let hub = Hub::new();
        let a = hub.attach(NodeId::derive(b"a"));
        let b = hub.attach(NodeId::derive(b"b"));

        for i in 0u8..10 {
            a.send(b.id(), Bytes::copy_from_slice(&[i])).await.unwrap();
        }
        for i in 0u8..10 {
            let (_, payload) = b.recv().await.unwrap();
            assert_eq!(payload[0], i);
        }
    }

    #[tokio::test]
    async fn send_to_addr_parses_mem_scheme() {
        let hub = Hub::new();
        let a = hub.attach(NodeId::derive(b"a"));
        let b = hub.attach(NodeId::derive(b"b"));

        a.send_to_addr(&b.local_addr(), Bytes::from_static(b"seed"))
            .await
            .unwrap();
        let (from, payload) = b.recv().await.unwrap();
        assert_eq!(from, a.id());
        assert_eq!(&payload[..], b"seed");

        assert!(a
            .send_to_addr("udp://nope", Bytes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn detached_peer_is_a_black_hole() {
        let hub = Hub::new();
        let a = hub.attach(NodeId::derive(b"a"));
        let b = hub.attach(NodeId::derive(b"b"));

        hub.detach(&b.id());
        // No error: unreachable, not unbound.
        a.send(b.id(), Bytes::from_static(b"lost")).await.unwrap();
    }

    #[tokio::test]
    async fn full_loss_drops_everything() {
        let hub = Hub::with_loss(1.0, 7);
        let a = hub.attach(NodeId::derive(b"a"));
        let b = hub.attach(NodeId::derive(b"b"));

        a.send(b.id(), Bytes::from_static(b"gone")).await.unwrap();

        // Nothing should arrive.
        let timeout =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.recv()).await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn seeded_loss_reproduces() {
        let outcomes = |seed: u64| {
            let hub = Hub::with_loss(0.5, seed);
            (0..32).map(|_| hub.should_drop()).collect::<Vec<_>>()
        };
        assert_eq!(outcomes(42), outcomes(42));
        assert_ne!(outcomes(42), outcomes(43));
    }
}
