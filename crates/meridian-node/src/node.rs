//! The node runtime: one event loop owning all mesh state.
//!
//! Routing table, map stores and subscription tables are mutated only
//! here, never behind a lock. The loop selects over four sources:
//! session commands, incoming transport messages, the heartbeat tick
//! (liveness probes, pending-deadline sweeps, topology repair) and the
//! gossip tick (peer records + pub/sub coverage).
//!
//! Remote round-trips park a oneshot sender in a pending table keyed
//! by request id; answers resolve it, the sweep expires it. A single
//! peer failure never exits the loop — it only feeds the repair path.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use meridian_codec::Value;
use meridian_map::{owner_of, replica_set, MapError, MapStore, ReplicaAck, Version};
use meridian_pubsub::{
    Callback, Circle, CoverageIndex, CoverageSummary, DedupWindow, PubSubError, PublishOptions,
    SubscriptionId, SubscriptionTable,
};
use meridian_topology::{NodeId, PeerRecord, RoutingTable};
use meridian_transport::Transport;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::ConnectError;
use crate::proto::{MapRequest, MapResponse, Message};

/// Lifecycle of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Contacting seeds; not yet serving.
    Joining,
    /// Full member of the mesh.
    Active,
    /// Handing off ownership before disconnect.
    Leaving,
}

/// Session-to-loop commands.
pub(crate) enum Command {
    SetPosition {
        x: f64,
        y: f64,
        resp: oneshot::Sender<(f64, f64)>,
    },
    MapGet {
        map: String,
        key: Vec<u8>,
        resp: oneshot::Sender<Result<Value, MapError>>,
    },
    MapSet {
        map: String,
        key: Vec<u8>,
        value: Value,
        ack: ReplicaAck,
        resp: oneshot::Sender<Result<(), MapError>>,
    },
    MapDelete {
        map: String,
        key: Vec<u8>,
        resp: oneshot::Sender<Result<(), MapError>>,
    },
    Subscribe {
        channel: String,
        topic: String,
        circle: Circle,
        callback: Callback,
        resp: oneshot::Sender<SubscriptionId>,
    },
    UnsubscribeTopic {
        channel: String,
        topic: String,
        resp: oneshot::Sender<usize>,
    },
    Publish {
        channel: String,
        topic: String,
        circle: Circle,
        value: Value,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<(), PubSubError>>,
    },
    Disconnect {
        resp: oneshot::Sender<()>,
    },
}

enum RequestCompletion {
    Get(oneshot::Sender<Result<Value, MapError>>),
    Write(oneshot::Sender<Result<(), MapError>>),
}

struct PendingRequest {
    completion: RequestCompletion,
    deadline: Instant,
}

enum WriteCompletion {
    Local(oneshot::Sender<Result<(), MapError>>),
    Remote { peer: NodeId, req_id: u64 },
}

struct PendingWrite {
    remaining: usize,
    completion: WriteCompletion,
    deadline: Instant,
}

struct PendingPublish {
    message: Message,
    unacked: HashSet<NodeId>,
    attempts_left: u32,
    next_resend: Instant,
    deadline: Instant,
    completion: oneshot::Sender<Result<(), PubSubError>>,
}

/// All state owned by the event loop.
pub(crate) struct Node {
    local_id: NodeId,
    local_addr: String,
    config: NodeConfig,
    lifecycle: Lifecycle,
    position: Option<(f64, f64)>,

    table: RoutingTable,
    maps: HashMap<String, MapStore>,
    subs: HashMap<String, SubscriptionTable>,
    coverage: HashMap<String, CoverageIndex>,
    local_coverage: HashMap<(String, String), CoverageSummary>,
    dedup: DedupWindow,

    pending_requests: HashMap<u64, PendingRequest>,
    pending_writes: HashMap<u64, PendingWrite>,
    pending_publishes: HashMap<u64, PendingPublish>,
    outstanding_probes: HashMap<NodeId, Instant>,

    next_id: u64,
    membership_dirty: bool,
}

impl Node {
    pub(crate) fn new(local_id: NodeId, config: NodeConfig) -> Self {
        Self {
            local_id,
            local_addr: String::new(),
            config,
            lifecycle: Lifecycle::Joining,
            position: None,
            table: RoutingTable::new(local_id),
            maps: HashMap::new(),
            subs: HashMap::new(),
            coverage: HashMap::new(),
            local_coverage: HashMap::new(),
            dedup: DedupWindow::default(),
            pending_requests: HashMap::new(),
            pending_writes: HashMap::new(),
            pending_publishes: HashMap::new(),
            outstanding_probes: HashMap::new(),
            next_id: 0,
            membership_dirty: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn own_record(&self) -> PeerRecord {
        let mut record = PeerRecord::new(self.local_id, self.local_addr.clone());
        if let Some((x, y)) = self.position {
            record = record.with_position(x, y);
        }
        record
    }

    /// Every live node this one can consider for ownership: routable
    /// peers plus itself.
    fn candidates(&self) -> Vec<NodeId> {
        let mut ids = self.table.routable_ids();
        ids.push(self.local_id);
        ids
    }

    async fn send_msg<T: Transport>(&self, transport: &T, peer: NodeId, msg: &Message) {
        if let Err(e) = transport.send(peer, msg.to_bytes()).await {
            debug!(peer = %peer, error = %e, "send failed");
        }
    }

    fn learn_record<T: Transport>(&mut self, transport: &T, record: PeerRecord) {
        if record.id == self.local_id {
            return;
        }
        if self.table.get(&record.id).is_none() {
            self.membership_dirty = true;
        }
        let _ = transport.bind_peer(record.id, &record.addr);
        self.table.observe(record);
    }

    // ------------------------------------------------------------------
    // Bootstrap

    pub(crate) async fn bootstrap<T: Transport>(
        &mut self,
        transport: &T,
    ) -> Result<(), ConnectError> {
        self.local_addr = transport.local_addr();

        if self.config.seeds.is_empty() {
            info!(id = %self.local_id, "starting fresh mesh");
            self.lifecycle = Lifecycle::Active;
            return Ok(());
        }

        let seeds = self.config.seeds.clone();
        let tried = seeds.len();
        for seed in &seeds {
            let join = Message::Join {
                record: self.own_record(),
                token: self.config.token.clone(),
            };
            if let Err(e) = transport.send_to_addr(seed, join.to_bytes()).await {
                debug!(seed = %seed, error = %e, "seed unreachable");
                continue;
            }

            let ack = tokio::time::timeout(
                self.config.request_timeout,
                Self::await_join_ack(transport),
            )
            .await;

            match ack {
                Ok(Some((accepted, records))) => {
                    if !accepted {
                        return Err(ConnectError::AuthRejected);
                    }
                    for record in records {
                        self.learn_record(transport, record);
                    }
                    info!(
                        id = %self.local_id,
                        peers = self.table.len(),
                        seed = %seed,
                        "joined mesh"
                    );
                    self.lifecycle = Lifecycle::Active;
                    return Ok(());
                }
                Ok(None) => return Err(ConnectError::Transport("transport closed".into())),
                Err(_) => {
                    debug!(seed = %seed, "seed did not answer in time");
                    continue;
                }
            }
        }

        Err(ConnectError::SeedsExhausted { tried })
    }

    async fn await_join_ack<T: Transport>(transport: &T) -> Option<(bool, Vec<PeerRecord>)> {
        loop {
            let (_, bytes) = transport.recv().await?;
            match Message::from_bytes(&bytes) {
                Some(Message::JoinAck { accepted, records }) => {
                    return Some((accepted, records))
                }
                // Anything else is premature during bootstrap; gossip
                // will re-deliver whatever mattered.
                _ => continue,
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands

    pub(crate) async fn handle_command<T: Transport>(&mut self, transport: &T, cmd: Command) {
        match cmd {
            Command::SetPosition { x, y, resp } => {
                self.position = Some((x, y));
                let _ = resp.send((x, y));
            }
            Command::MapGet { map, key, resp } => {
                self.local_get(transport, map, key, resp).await;
            }
            Command::MapSet {
                map,
                key,
                value,
                ack,
                resp,
            } => {
                let version = Version::now(self.local_id);
                self.local_write(transport, map, key, Some(value), version, ack, resp)
                    .await;
            }
            Command::MapDelete { map, key, resp } => {
                let version = Version::now(self.local_id);
                self.local_write(transport, map, key, None, version, ReplicaAck::One, resp)
                    .await;
            }
            Command::Subscribe {
                channel,
                topic,
                circle,
                callback,
                resp,
            } => {
                let table = self.subs.entry(channel.clone()).or_default();
                let id = table.subscribe(topic.clone(), circle, callback);
                let summary = CoverageSummary::new(topic.clone(), table.coverage(&topic));
                self.local_coverage.insert((channel, topic), summary);
                let _ = resp.send(id);
            }
            Command::UnsubscribeTopic {
                channel,
                topic,
                resp,
            } => {
                let removed = self
                    .subs
                    .get_mut(&channel)
                    .map(|table| table.unsubscribe_topic(&topic))
                    .unwrap_or(0);
                self.local_coverage.insert(
                    (channel, topic.clone()),
                    CoverageSummary::new(topic, None),
                );
                let _ = resp.send(removed);
            }
            Command::Publish {
                channel,
                topic,
                circle,
                value,
                opts,
                resp,
            } => {
                self.local_publish(transport, channel, topic, circle, value, opts, resp)
                    .await;
            }
            Command::Disconnect { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn local_get<T: Transport>(
        &mut self,
        transport: &T,
        map: String,
        key: Vec<u8>,
        resp: oneshot::Sender<Result<Value, MapError>>,
    ) {
        let key_id = NodeId::for_key(&map, &key);
        let set = replica_set(&key_id, &self.candidates(), self.config.replication);
        let store = self.maps.entry(map.clone()).or_default();

        if set.first() == Some(&self.local_id) {
            // Owner answers authoritatively.
            let result = match store.get(&key) {
                Some(value) => Ok(value.clone()),
                None => Err(MapError::NotFound),
            };
            let _ = resp.send(result);
            return;
        }

        if set.contains(&self.local_id) {
            // Replica read: answer from the local copy when we hold
            // one; fall through to the owner during a handoff window.
            if let Some(entry) = store.entry(&key) {
                let result = match &entry.value {
                    Some(value) => Ok(value.clone()),
                    None => Err(MapError::NotFound),
                };
                let _ = resp.send(result);
                return;
            }
        }

        let req_id = self.next_id();
        self.pending_requests.insert(
            req_id,
            PendingRequest {
                completion: RequestCompletion::Get(resp),
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        self.route_request(transport, req_id, key_id, MapRequest::Get { map, key })
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn local_write<T: Transport>(
        &mut self,
        transport: &T,
        map: String,
        key: Vec<u8>,
        value: Option<Value>,
        version: Version,
        ack: ReplicaAck,
        resp: oneshot::Sender<Result<(), MapError>>,
    ) {
        let key_id = NodeId::for_key(&map, &key);
        let set = replica_set(&key_id, &self.candidates(), self.config.replication);

        if set.first() == Some(&self.local_id) {
            self.owner_apply_write(
                transport,
                map,
                key,
                value,
                version,
                ack,
                WriteCompletion::Local(resp),
            )
            .await;
            return;
        }

        let req_id = self.next_id();
        self.pending_requests.insert(
            req_id,
            PendingRequest {
                completion: RequestCompletion::Write(resp),
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        let request = match value {
            Some(value) => MapRequest::Set {
                map,
                key,
                value,
                version,
                ack,
            },
            None => MapRequest::Delete { map, key, version },
        };
        self.route_request(transport, req_id, key_id, request).await;
    }

    /// First hop of key-space routing, from the local node.
    async fn route_request<T: Transport>(
        &mut self,
        transport: &T,
        req_id: u64,
        key: NodeId,
        request: MapRequest,
    ) {
        let Some(hop) = self.table.next_hop(&key) else {
            self.fail_request(req_id, MapError::Route(
                meridian_topology::RouteError::NoPath(key),
            ));
            return;
        };
        let msg = Message::Request {
            req_id,
            from: self.local_id,
            key,
            ttl: self.config.max_route_hops,
            request,
        };
        self.send_msg(transport, hop, &msg).await;
    }

    fn fail_request(&mut self, req_id: u64, error: MapError) {
        if let Some(pending) = self.pending_requests.remove(&req_id) {
            match pending.completion {
                RequestCompletion::Get(tx) => {
                    let _ = tx.send(Err(error));
                }
                RequestCompletion::Write(tx) => {
                    let _ = tx.send(Err(error));
                }
            }
        }
    }

    /// Apply a write as the owner and fan out replication.
    #[allow(clippy::too_many_arguments)]
    async fn owner_apply_write<T: Transport>(
        &mut self,
        transport: &T,
        map: String,
        key: Vec<u8>,
        value: Option<Value>,
        version: Version,
        ack: ReplicaAck,
        completion: WriteCompletion,
    ) {
        let key_id = NodeId::for_key(&map, &key);
        let set = replica_set(&key_id, &self.candidates(), self.config.replication);
        let replicas: Vec<NodeId> = set
            .into_iter()
            .filter(|id| *id != self.local_id)
            .collect();

        let store = self.maps.entry(map.clone()).or_default();
        match value {
            Some(value) => store.put(key.clone(), value, version),
            None => store.delete(key.clone(), version),
        };
        // The write we just merged (or a concurrent newer one; either
        // way this is the state replicas must converge to).
        let entry = store.entry(&key).cloned().expect("entry just written");

        let required = ack.required(replicas.len());
        let write_id = self.next_id();

        for replica in &replicas {
            let msg = Message::Request {
                req_id: write_id,
                from: self.local_id,
                key: key_id,
                ttl: 0,
                request: MapRequest::Replicate {
                    map: map.clone(),
                    key: key.clone(),
                    entry: entry.clone(),
                },
            };
            self.send_msg(transport, *replica, &msg).await;
        }

        if required == 0 {
            self.complete_write(transport, completion, Ok(())).await;
        } else {
            self.pending_writes.insert(
                write_id,
                PendingWrite {
                    remaining: required,
                    completion,
                    deadline: Instant::now() + self.config.request_timeout,
                },
            );
        }
    }

    async fn complete_write<T: Transport>(
        &mut self,
        transport: &T,
        completion: WriteCompletion,
        result: Result<(), MapError>,
    ) {
        match completion {
            WriteCompletion::Local(tx) => {
                let _ = tx.send(result);
            }
            WriteCompletion::Remote { peer, req_id } => {
                // On failure (replica-ack timeout) send nothing: the
                // requester's own deadline turns silence into Timeout.
                if result.is_ok() {
                    let msg = Message::Response {
                        req_id,
                        response: MapResponse::Ok,
                    };
                    self.send_msg(transport, peer, &msg).await;
                }
            }
        }
    }

    async fn local_publish<T: Transport>(
        &mut self,
        transport: &T,
        channel: String,
        topic: String,
        circle: Circle,
        value: Value,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<(), PubSubError>>,
    ) {
        // Local subscriptions first.
        if let Some(table) = self.subs.get_mut(&channel) {
            let delivered = table.deliver(&topic, &circle, &value);
            trace!(channel = %channel, topic = %topic, delivered, "local deliveries");
        }

        let targets: Vec<NodeId> = self
            .coverage
            .get(&channel)
            .map(|index| index.matching_nodes(&topic, &circle))
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != self.local_id)
            .collect();

        let seq = self.next_id();
        let msg = Message::Publish {
            channel,
            topic,
            circle,
            value,
            publisher: self.local_id,
            seq,
            ack: opts.ack,
        };

        for target in &targets {
            self.send_msg(transport, *target, &msg).await;
        }

        if !opts.ack || targets.is_empty() {
            let _ = resp.send(Ok(()));
            return;
        }

        let resend_interval =
            self.config.request_timeout / (self.config.publish_retries + 1).max(1);
        self.pending_publishes.insert(
            seq,
            PendingPublish {
                message: msg,
                unacked: targets.into_iter().collect(),
                attempts_left: self.config.publish_retries,
                next_resend: Instant::now() + resend_interval,
                deadline: Instant::now() + self.config.request_timeout,
                completion: resp,
            },
        );
    }

    // ------------------------------------------------------------------
    // Incoming messages

    pub(crate) async fn handle_datagram<T: Transport>(
        &mut self,
        transport: &T,
        from: NodeId,
        bytes: &[u8],
    ) {
        let Some(msg) = Message::from_bytes(bytes) else {
            trace!(from = %from, "dropping undecodable datagram");
            return;
        };

        // Hearing from a peer is as good as a pong.
        self.table.touch(&from);
        self.outstanding_probes.remove(&from);

        match msg {
            Message::Join { record, token } => {
                self.handle_join(transport, from, record, token).await;
            }
            Message::JoinAck { .. } => {
                // Only meaningful during bootstrap; stale here.
            }
            Message::Leave { id } => {
                debug!(peer = %id, "peer left");
                self.table.remove(&id);
                self.forget_peer(&id);
            }
            Message::Ping { nonce } => {
                self.send_msg(transport, from, &Message::Pong { nonce })
                    .await;
            }
            Message::Pong { .. } => {
                // touch above already credited the peer.
            }
            Message::Gossip { records, coverage } => {
                for record in records {
                    self.learn_record(transport, record);
                }
                for (channel, node, summary) in coverage {
                    if node == self.local_id {
                        continue;
                    }
                    self.coverage
                        .entry(channel)
                        .or_default()
                        .merge(node, &[summary]);
                }
            }
            Message::Request {
                req_id,
                from: origin,
                key,
                ttl,
                request,
            } => {
                self.handle_request(transport, from, req_id, origin, key, ttl, request)
                    .await;
            }
            Message::Response { req_id, response } => {
                self.handle_response(transport, from, req_id, response).await;
            }
            Message::Handoff { map, batch } => {
                let store = self.maps.entry(map.clone()).or_default();
                let count = batch.len();
                for (key, entry) in batch {
                    store.apply(key, entry);
                }
                debug!(map = %map, count, from = %from, "received handoff batch");
            }
            Message::Publish {
                channel,
                topic,
                circle,
                value,
                publisher,
                seq,
                ack,
            } => {
                let fresh = self.dedup.observe(publisher, seq);
                if fresh {
                    if let Some(table) = self.subs.get_mut(&channel) {
                        let delivered = table.deliver(&topic, &circle, &value);
                        trace!(
                            channel = %channel,
                            topic = %topic,
                            publisher = %publisher,
                            delivered,
                            "publish delivered"
                        );
                    }
                }
                if ack {
                    // Acknowledge duplicates too: the prior ack may
                    // have been lost.
                    self.send_msg(transport, from, &Message::PublishAck { publisher, seq })
                        .await;
                }
            }
            Message::PublishAck { publisher, seq } => {
                if publisher != self.local_id {
                    return;
                }
                let done = match self.pending_publishes.get_mut(&seq) {
                    Some(pending) => {
                        pending.unacked.remove(&from);
                        pending.unacked.is_empty()
                    }
                    None => false,
                };
                if done {
                    if let Some(pending) = self.pending_publishes.remove(&seq) {
                        let _ = pending.completion.send(Ok(()));
                    }
                }
            }
        }
    }

    async fn handle_join<T: Transport>(
        &mut self,
        transport: &T,
        from: NodeId,
        record: PeerRecord,
        token: Option<String>,
    ) {
        if self.config.token.is_some() && token != self.config.token {
            warn!(peer = %from, "join rejected: bad token");
            let ack = Message::JoinAck {
                accepted: false,
                records: Vec::new(),
            };
            self.send_msg(transport, from, &ack).await;
            return;
        }

        self.learn_record(transport, record);

        let mut records = self.table.newest_records(self.config.gossip_records);
        records.push(self.own_record());
        let ack = Message::JoinAck {
            accepted: true,
            records,
        };
        self.send_msg(transport, from, &ack).await;
        debug!(peer = %from, "admitted joiner");
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request<T: Transport>(
        &mut self,
        transport: &T,
        sender: NodeId,
        req_id: u64,
        origin: NodeId,
        key: NodeId,
        ttl: u8,
        request: MapRequest,
    ) {
        // Replication applies wherever it lands; last-writer-wins
        // guards against reordering.
        let request = match request {
            MapRequest::Replicate { map, key, entry } => {
                self.maps.entry(map).or_default().apply(key, entry);
                let msg = Message::Response {
                    req_id,
                    response: MapResponse::Ok,
                };
                self.send_msg(transport, sender, &msg).await;
                return;
            }
            other => other,
        };

        // Not for us? Pass it along the gradient.
        if ttl > 0 {
            if let Some(hop) = self.table.next_hop(&key) {
                let msg = Message::Request {
                    req_id,
                    from: origin,
                    key,
                    ttl: ttl - 1,
                    request,
                };
                self.send_msg(transport, hop, &msg).await;
                return;
            }
        }

        let owner = owner_of(&key, &self.candidates()).unwrap_or(self.local_id);
        if owner != self.local_id {
            // TTL ran out short of the owner, or our view disagrees
            // mid-handoff. Surface it; the caller decides on retry.
            let msg = Message::Response {
                req_id,
                response: MapResponse::OwnershipConflict {
                    believed_owner: owner,
                },
            };
            self.send_msg(transport, origin, &msg).await;
            return;
        }

        match request {
            MapRequest::Get { map, key } => {
                let response = match self.maps.entry(map).or_default().get(&key) {
                    Some(value) => MapResponse::Value(value.clone()),
                    None => MapResponse::NotFound,
                };
                self.send_msg(transport, origin, &Message::Response { req_id, response })
                    .await;
            }
            MapRequest::Set {
                map,
                key,
                value,
                version,
                ack,
            } => {
                self.owner_apply_write(
                    transport,
                    map,
                    key,
                    Some(value),
                    version,
                    ack,
                    WriteCompletion::Remote {
                        peer: origin,
                        req_id,
                    },
                )
                .await;
            }
            MapRequest::Delete { map, key, version } => {
                self.owner_apply_write(
                    transport,
                    map,
                    key,
                    None,
                    version,
                    ReplicaAck::One,
                    WriteCompletion::Remote {
                        peer: origin,
                        req_id,
                    },
                )
                .await;
            }
            MapRequest::Replicate { .. } => {}
        }
    }

    async fn handle_response<T: Transport>(
        &mut self,
        transport: &T,
        from: NodeId,
        req_id: u64,
        response: MapResponse,
    ) {
        // Replica acknowledgment for a write we own?
        if let Some(write) = self.pending_writes.get_mut(&req_id) {
            if matches!(response, MapResponse::Ok) {
                write.remaining = write.remaining.saturating_sub(1);
                if write.remaining == 0 {
                    let write = self.pending_writes.remove(&req_id).unwrap();
                    self.complete_write(transport, write.completion, Ok(())).await;
                }
            }
            return;
        }

        // Otherwise: the answer to one of our own requests.
        let Some(pending) = self.pending_requests.remove(&req_id) else {
            trace!(req_id, "response for unknown request");
            return;
        };
        match pending.completion {
            RequestCompletion::Get(tx) => {
                let result = match response {
                    MapResponse::Value(value) => Ok(value),
                    MapResponse::NotFound => Err(MapError::NotFound),
                    MapResponse::Ok => Ok(Value::Nil),
                    MapResponse::OwnershipConflict { believed_owner } => {
                        Err(MapError::OwnershipConflict {
                            contacted: from,
                            believed_owner,
                        })
                    }
                };
                let _ = tx.send(result);
            }
            RequestCompletion::Write(tx) => {
                let result = match response {
                    MapResponse::Ok | MapResponse::Value(_) => Ok(()),
                    MapResponse::NotFound => Err(MapError::NotFound),
                    MapResponse::OwnershipConflict { believed_owner } => {
                        Err(MapError::OwnershipConflict {
                            contacted: from,
                            believed_owner,
                        })
                    }
                };
                let _ = tx.send(result);
            }
        }
    }

    fn forget_peer(&mut self, id: &NodeId) {
        for index in self.coverage.values_mut() {
            index.remove_node(id);
        }
        self.outstanding_probes.remove(id);
        self.membership_dirty = true;
    }

    // ------------------------------------------------------------------
    // Timers

    pub(crate) async fn on_heartbeat<T: Transport>(&mut self, transport: &T) {
        let now = Instant::now();

        // Unanswered probes become failures.
        let expired: Vec<NodeId> = self
            .outstanding_probes
            .iter()
            .filter(|(_, sent)| now.duration_since(**sent) > self.config.request_timeout)
            .map(|(id, _)| *id)
            .collect();
        for peer in expired {
            self.outstanding_probes.remove(&peer);
            if let Some(state) = self.table.record_failure(&peer) {
                debug!(peer = %peer, state = ?state, "probe unanswered");
            }
        }

        // Purge the dead; their keys get new owners below.
        let dead = self.table.purge_dead();
        for peer in &dead {
            info!(peer = %peer, "peer declared dead");
            self.forget_peer(peer);
        }

        // Probe the quiet.
        for peer in self.table.due_probe(self.config.probe_idle) {
            if !self.outstanding_probes.contains_key(&peer) {
                self.outstanding_probes.insert(peer, now);
                let nonce = self.next_id();
                self.send_msg(transport, peer, &Message::Ping { nonce })
                    .await;
            }
        }

        self.sweep_deadlines(transport, now).await;
        self.resend_publishes(transport, now).await;

        if self.membership_dirty {
            self.membership_dirty = false;
            self.rebalance(transport).await;
        }
    }

    async fn sweep_deadlines<T: Transport>(&mut self, transport: &T, now: Instant) {
        let expired: Vec<u64> = self
            .pending_requests
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for req_id in expired {
            self.fail_request(req_id, MapError::Timeout);
        }

        let expired: Vec<u64> = self
            .pending_writes
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for write_id in expired {
            if let Some(write) = self.pending_writes.remove(&write_id) {
                self.complete_write(transport, write.completion, Err(MapError::Timeout))
                    .await;
            }
        }

        let expired: Vec<u64> = self
            .pending_publishes
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(pending) = self.pending_publishes.remove(&seq) {
                let _ = pending.completion.send(Err(PubSubError::Timeout));
            }
        }
    }

    async fn resend_publishes<T: Transport>(&mut self, transport: &T, now: Instant) {
        let resend_interval =
            self.config.request_timeout / (self.config.publish_retries + 1).max(1);

        let mut outgoing: Vec<(NodeId, Message)> = Vec::new();
        for pending in self.pending_publishes.values_mut() {
            if now >= pending.next_resend && pending.attempts_left > 0 {
                pending.attempts_left -= 1;
                pending.next_resend = now + resend_interval;
                for target in &pending.unacked {
                    outgoing.push((*target, pending.message.clone()));
                }
            }
        }
        for (target, msg) in outgoing {
            self.send_msg(transport, target, &msg).await;
        }
    }

    /// Re-establish the ownership invariant after membership changed:
    /// stream away entries this node no longer holds a replica claim
    /// on, and re-replicate the entries it owns.
    async fn rebalance<T: Transport>(&mut self, transport: &T) {
        let candidates = self.candidates();
        let replication = self.config.replication;
        let local = self.local_id;

        let mut outgoing: Vec<(NodeId, Message)> = Vec::new();
        let mut replications: Vec<(NodeId, String, Vec<u8>, meridian_map::MapEntry)> = Vec::new();

        let map_names: Vec<String> = self.maps.keys().cloned().collect();
        for name in map_names {
            let store = self.maps.get_mut(&name).unwrap();

            let batches = store.drain_not_owned(&local, |key| {
                let key_id = NodeId::for_key(&name, key);
                let set = replica_set(&key_id, &candidates, replication);
                if set.contains(&local) {
                    Some(local)
                } else {
                    set.first().copied()
                }
            });
            for (owner, batch) in batches {
                outgoing.push((
                    owner,
                    Message::Handoff {
                        map: name.clone(),
                        batch,
                    },
                ));
            }

            // Any holder pushes copies to the rest of the set: after a
            // join the new owner may be a node that has never seen the
            // key, and only its replicas can close that gap.
            for (key, entry) in store.iter() {
                let key_id = NodeId::for_key(&name, key);
                let set = replica_set(&key_id, &candidates, replication);
                if set.contains(&local) {
                    for member in set.iter().filter(|id| **id != local) {
                        replications.push((*member, name.clone(), key.clone(), entry.clone()));
                    }
                }
            }
        }

        for (replica, map, key, entry) in replications {
            let key_id = NodeId::for_key(&map, &key);
            let req_id = self.next_id();
            let msg = Message::Request {
                req_id,
                from: local,
                key: key_id,
                ttl: 0,
                request: MapRequest::Replicate { map, key, entry },
            };
            outgoing.push((replica, msg));
        }

        if !outgoing.is_empty() {
            debug!(messages = outgoing.len(), "rebalancing after membership change");
        }
        for (peer, msg) in outgoing {
            self.send_msg(transport, peer, &msg).await;
        }
    }

    pub(crate) async fn on_gossip<T: Transport>(&mut self, transport: &T) {
        let peers = self.table.routable_ids();
        if peers.is_empty() {
            return;
        }

        let mut records = self.table.newest_records(self.config.gossip_records);
        records.push(self.own_record());

        let mut coverage: Vec<(String, NodeId, CoverageSummary)> = self
            .local_coverage
            .iter()
            .map(|((channel, _topic), summary)| (channel.clone(), self.local_id, summary.clone()))
            .collect();
        for (channel, index) in &self.coverage {
            for (node, summary) in index.snapshot() {
                coverage.push((channel.clone(), node, summary));
            }
        }

        let msg = Message::Gossip { records, coverage };

        let mut sample = peers;
        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(self.config.gossip_fanout);

        for peer in sample {
            self.send_msg(transport, peer, &msg).await;
        }
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Graceful departure: hand every entry to its next owner, then
    /// announce the leave.
    pub(crate) async fn leave<T: Transport>(&mut self, transport: &T) {
        self.lifecycle = Lifecycle::Leaving;
        let others = self.table.routable_ids();
        if others.is_empty() {
            return;
        }

        let mut outgoing: Vec<(NodeId, Message)> = Vec::new();
        let map_names: Vec<String> = self.maps.keys().cloned().collect();
        for name in map_names {
            let store = self.maps.get_mut(&name).unwrap();
            let batches = store.drain_not_owned(&self.local_id, |key| {
                let key_id = NodeId::for_key(&name, key);
                owner_of(&key_id, &others)
            });
            for (owner, batch) in batches {
                outgoing.push((
                    owner,
                    Message::Handoff {
                        map: name.clone(),
                        batch,
                    },
                ));
            }
        }

        for (peer, msg) in outgoing {
            self.send_msg(transport, peer, &msg).await;
        }

        let leave = Message::Leave { id: self.local_id };
        for peer in others {
            self.send_msg(transport, peer, &leave).await;
        }
        info!(id = %self.local_id, "left mesh");
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}

/// Drive a node until its session disconnects or the transport closes.
pub(crate) async fn run<T: Transport>(
    mut node: Node,
    transport: T,
    mut cmd_rx: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), ConnectError>>,
) {
    match node.bootstrap(&transport).await {
        Ok(()) => {
            debug!(state = ?node.lifecycle(), "node ready");
            if ready.send(Ok(())).is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(node.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut gossip = tokio::time::interval(node.config.gossip_interval);
    gossip.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Disconnect { resp }) => {
                    node.leave(&transport).await;
                    let _ = resp.send(());
                    break;
                }
                Some(cmd) => node.handle_command(&transport, cmd).await,
                None => {
                    // Session dropped without an explicit disconnect;
                    // still leave politely.
                    node.leave(&transport).await;
                    break;
                }
            },
            incoming = transport.recv() => match incoming {
                Some((from, bytes)) => node.handle_datagram(&transport, from, &bytes).await,
                None => {
                    warn!("transport closed; stopping node");
                    break;
                }
            },
            _ = heartbeat.tick() => node.on_heartbeat(&transport).await,
            _ = gossip.tick() => node.on_gossip(&transport).await,
        }
    }
}
