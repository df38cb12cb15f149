//! Node configuration.

use std::time::Duration;

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Seed addresses to try, in order, at join time. An empty list
    /// starts a fresh mesh with this node as the first member.
    pub seeds: Vec<String>,

    /// Shared cluster token. Presented to seeds on join and checked
    /// against joiners afterwards. `None` disables the check.
    pub token: Option<String>,

    /// Replicas kept beyond the primary owner of each key.
    pub replication: usize,

    /// Deadline for one remote round-trip (map requests, join
    /// handshake per seed, acknowledged publishes).
    pub request_timeout: Duration,

    /// How often liveness probes are considered.
    pub heartbeat_interval: Duration,

    /// A peer silent for this long gets probed.
    pub probe_idle: Duration,

    /// How often peer records and coverage summaries are gossiped.
    pub gossip_interval: Duration,

    /// Peers sampled per gossip round.
    pub gossip_fanout: usize,

    /// Records piggybacked per gossip message.
    pub gossip_records: usize,

    /// Resend attempts for acknowledged publishes, beyond the first
    /// send.
    pub publish_retries: u32,

    /// Hops a request may take through the mesh before it is handled
    /// where it stands.
    pub max_route_hops: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            token: None,
            replication: meridian_map::DEFAULT_REPLICATION,
            request_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
            probe_idle: Duration::from_secs(5),
            gossip_interval: Duration::from_secs(2),
            gossip_fanout: 3,
            gossip_records: 16,
            publish_retries: 2,
            max_route_hops: 16,
        }
    }
}

impl NodeConfig {
    /// Config joining through the given seeds.
    #[must_use]
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the shared cluster token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the remote round-trip deadline.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the replica count beyond the primary.
    #[must_use]
    pub fn with_replication(mut self, replicas: usize) -> Self {
        self.replication = replicas;
        self
    }

    /// Aggressive timers for tests and local simulation.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(50),
            probe_idle: Duration::from_millis(150),
            gossip_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }
}
