//! The session facade: the application's view of one mesh node.
//!
//! A [`Session`] owns the background event loop and hands out named
//! channel handles: [`MapHandle`] for distributed maps and
//! [`PubSubHandle`] for geospatial pub/sub. Handles are lightweight,
//! cloneable, and reference shared state by name through the command
//! channel — never by raw pointer. Repeated `access_*` calls with the
//! same name return the cached handle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use meridian_codec::Value;
use meridian_map::{MapError, ReplicaAck};
use meridian_pubsub::{Circle, PubSubError, PublishOptions, SubscriptionId};
use meridian_topology::NodeId;
use meridian_transport::Transport;
use tokio::sync::{mpsc, oneshot};

use crate::config::NodeConfig;
use crate::error::{ConnectError, Error, Result};
use crate::node::{run, Command, Node};

const COMMAND_QUEUE: usize = 64;

/// Slack added on top of the node-side deadline so the loop's Timeout
/// answer wins over the caller's backstop in the common case.
const CALLER_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// A connected mesh node.
#[derive(Debug)]
pub struct Session {
    local_id: NodeId,
    cmd_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
    maps: Mutex<HashMap<String, MapHandle>>,
    pubsubs: Mutex<HashMap<String, PubSubHandle>>,
}

impl Session {
    /// Join the mesh through the configured seeds and start the node's
    /// event loop. With no seeds configured, this node starts a fresh
    /// mesh (and can serve as a seed for others).
    ///
    /// `local_id` must be the identifier the transport was bound with.
    pub async fn connect<T: Transport>(
        local_id: NodeId,
        transport: T,
        config: NodeConfig,
    ) -> std::result::Result<Self, ConnectError> {
        let request_timeout = config.request_timeout;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let node = Node::new(local_id, config);
        tokio::spawn(run(node, transport, cmd_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                local_id,
                cmd_tx,
                request_timeout,
                maps: Mutex::new(HashMap::new()),
                pubsubs: Mutex::new(HashMap::new()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Transport("node task died".into())),
        }
    }

    /// This node's identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Announce this node's geospatial position. Returns the applied
    /// position.
    pub async fn set_position(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetPosition { x, y, resp: tx })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Access a named distributed map. Distinct names are independent
    /// keyspaces; repeated calls return the cached handle.
    pub fn access_map(&self, name: &str) -> MapHandle {
        let mut maps = self.maps.lock().unwrap();
        maps.entry(name.to_owned())
            .or_insert_with(|| MapHandle {
                name: name.to_owned(),
                cmd_tx: self.cmd_tx.clone(),
                timeout: self.request_timeout + CALLER_TIMEOUT_SLACK,
            })
            .clone()
    }

    /// Access a named geospatial pub/sub channel. Topic namespaces are
    /// independent across names; repeated calls return the cached
    /// handle.
    pub fn access_pubsub(&self, name: &str) -> PubSubHandle {
        let mut pubsubs = self.pubsubs.lock().unwrap();
        pubsubs
            .entry(name.to_owned())
            .or_insert_with(|| PubSubHandle {
                name: name.to_owned(),
                cmd_tx: self.cmd_tx.clone(),
                timeout: self.request_timeout + CALLER_TIMEOUT_SLACK,
            })
            .clone()
    }

    /// Leave the mesh gracefully: ownership is handed off and peers
    /// are notified before the loop stops.
    pub async fn disconnect(self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Disconnect { resp: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Handle to one named distributed map.
#[derive(Debug, Clone)]
pub struct MapHandle {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl MapHandle {
    /// The map's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a key.
    pub async fn get(&self, key: impl Into<Value>) -> std::result::Result<Value, MapError> {
        let key = meridian_codec::encode(&key.into());
        let (tx, rx) = oneshot::channel();
        let cmd = Command::MapGet {
            map: self.name.clone(),
            key,
            resp: tx,
        };
        self.round_trip(cmd, rx).await
    }

    /// Write a key, waiting for one replica acknowledgment.
    pub async fn set(
        &self,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> std::result::Result<(), MapError> {
        self.set_with(key, value, ReplicaAck::One).await
    }

    /// Write a key with an explicit acknowledgment level.
    pub async fn set_with(
        &self,
        key: impl Into<Value>,
        value: impl Into<Value>,
        ack: ReplicaAck,
    ) -> std::result::Result<(), MapError> {
        let key = meridian_codec::encode(&key.into());
        let (tx, rx) = oneshot::channel();
        let cmd = Command::MapSet {
            map: self.name.clone(),
            key,
            value: value.into(),
            ack,
            resp: tx,
        };
        self.round_trip(cmd, rx).await
    }

    /// Delete a key.
    pub async fn delete(&self, key: impl Into<Value>) -> std::result::Result<(), MapError> {
        let key = meridian_codec::encode(&key.into());
        let (tx, rx) = oneshot::channel();
        let cmd = Command::MapDelete {
            map: self.name.clone(),
            key,
            resp: tx,
        };
        self.round_trip(cmd, rx).await
    }

    async fn round_trip<R>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<std::result::Result<R, MapError>>,
    ) -> std::result::Result<R, MapError> {
        // A closed loop is indistinguishable from an unreachable one
        // from the caller's seat; both surface as Timeout.
        self.cmd_tx.send(cmd).await.map_err(|_| MapError::Timeout)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(MapError::Timeout),
        }
    }
}

/// Handle to one named geospatial pub/sub channel.
#[derive(Debug, Clone)]
pub struct PubSubHandle {
    name: String,
    cmd_tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl PubSubHandle {
    /// The channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback for publishes on `topic` whose circle
    /// intersects the one given here. The callback runs on the node's
    /// event loop.
    pub async fn on<F>(
        &self,
        topic: &str,
        x: f64,
        y: f64,
        radius: f64,
        callback: F,
    ) -> std::result::Result<SubscriptionId, PubSubError>
    where
        F: FnMut(Value) + Send + Sync + 'static,
    {
        let circle = Circle::new(x, y, radius)?;
        let (tx, rx) = oneshot::channel();
        let cmd = Command::Subscribe {
            channel: self.name.clone(),
            topic: topic.to_owned(),
            circle,
            callback: Box::new(callback),
            resp: tx,
        };
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| PubSubError::Timeout)?;
        rx.await.map_err(|_| PubSubError::Timeout)
    }

    /// Drop every subscription for a topic.
    pub async fn off(&self, topic: &str) -> std::result::Result<(), PubSubError> {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::UnsubscribeTopic {
            channel: self.name.clone(),
            topic: topic.to_owned(),
            resp: tx,
        };
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| PubSubError::Timeout)?;
        rx.await.map(|_| ()).map_err(|_| PubSubError::Timeout)
    }

    /// Publish a value at (x, y) with the given radius. Delivery
    /// reaches exactly the subscriptions whose circle intersects the
    /// publish circle.
    pub async fn publish(
        &self,
        topic: &str,
        x: f64,
        y: f64,
        radius: f64,
        value: impl Into<Value>,
        opts: PublishOptions,
    ) -> std::result::Result<(), PubSubError> {
        let circle = Circle::new(x, y, radius)?;
        let (tx, rx) = oneshot::channel();
        let cmd = Command::Publish {
            channel: self.name.clone(),
            topic: topic.to_owned(),
            circle,
            value: value.into(),
            opts,
            resp: tx,
        };
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| PubSubError::Timeout)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(PubSubError::Timeout),
        }
    }
}
