//! Deterministic multi-node simulator.
//!
//! [`SimNetwork`] runs any number of [`Mesh`] instances in one process
//! against a virtual clock. It plays the part of the radio and the
//! transport: it answers scans with the nodes in range, opens and closes
//! links, brings uplinks up and carries frames between connections.
//! All randomness comes from one seeded generator, so a run with the same
//! seed replays exactly.
//!
//! ## Features
//!
//! - **Message Loss**: drop frames with a configurable probability
//! - **Network Partitions**: silence chosen node pairs in both directions
//! - **Latency Injection**: delay frame delivery
//! - **Clock Skew**: give each node its own boot offset
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use treemesh::testing::SimNetwork;
//! use treemesh::{Mesh, MeshConfig, NodeId, NoopDelegate};
//!
//! let config = MeshConfig::fast_failover().with_mesh("demo", "secret").with_rng_seed(1);
//! let mut sim = SimNetwork::new(7);
//! for id in 1..=3 {
//!     let mesh = Mesh::new(NodeId::new(id), config.clone(), NoopDelegate).unwrap();
//!     sim.add_node(mesh);
//! }
//! sim.connect_all(-50);
//!
//! assert!(sim.run_until(Duration::from_secs(60), |sim| sim.is_converged()));
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::connection::Direction;
use crate::lifecycle::{LifecycleAction, ScanResult};
use crate::mesh::{Mesh, MeshDelegate};
use crate::types::{ConnectionId, NodeId, Timestamp};

/// Default simulation step.
pub const DEFAULT_STEP: Duration = Duration::from_millis(10);

/// Shortest time a scan takes.
pub const SCAN_DURATION_MIN: Duration = Duration::from_millis(50);

/// Longest time a scan takes.
pub const SCAN_DURATION_MAX: Duration = Duration::from_millis(500);

/// Upper bound on settle rounds per step.
const MAX_SETTLE_ROUNDS: usize = 64;

/// Configuration for chaos testing.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of dropping a frame (0.0 to 1.0).
    pub message_loss_rate: f64,

    /// Latency added to every frame.
    pub base_latency: Duration,

    /// Random jitter added to latency (0 to this value).
    pub latency_jitter: Duration,

    /// Whether chaos is applied at all.
    pub enabled: bool,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            message_loss_rate: 0.0,
            base_latency: Duration::ZERO,
            latency_jitter: Duration::ZERO,
            enabled: false,
        }
    }
}

impl ChaosConfig {
    /// No chaos.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mild conditions: 1% loss, 5ms latency with 5ms jitter.
    pub fn moderate() -> Self {
        Self {
            message_loss_rate: 0.01,
            base_latency: Duration::from_millis(5),
            latency_jitter: Duration::from_millis(5),
            enabled: true,
        }
    }

    /// Set the frame loss probability and enable chaos.
    pub fn with_message_loss_rate(mut self, rate: f64) -> Self {
        self.message_loss_rate = rate.clamp(0.0, 1.0);
        self.enabled = true;
        self
    }

    /// Set the base latency and enable chaos.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.base_latency = latency;
        self.enabled = true;
        self
    }

    /// Set the latency jitter and enable chaos.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.latency_jitter = jitter;
        self.enabled = true;
        self
    }

    /// Switch chaos on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether a frame should be dropped.
    pub fn should_drop<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if !self.enabled || self.message_loss_rate == 0.0 {
            return false;
        }
        rng.random::<f64>() < self.message_loss_rate
    }

    /// Latency for one frame (base plus random jitter).
    pub fn get_latency<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let jitter = if self.latency_jitter > Duration::ZERO {
            let max = self.latency_jitter.as_micros() as u64;
            Duration::from_micros(rng.random_range(0..=max))
        } else {
            Duration::ZERO
        };
        self.base_latency + jitter
    }
}

/// Pairs of nodes that cannot hear each other.
#[derive(Debug, Default, Clone)]
pub struct NetworkPartition {
    partitioned: HashSet<(NodeId, NodeId)>,
}

impl NetworkPartition {
    /// No partitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Silence the pair in both directions.
    pub fn partition(&mut self, a: NodeId, b: NodeId) {
        self.partitioned.insert((a, b));
        self.partitioned.insert((b, a));
    }

    /// Let the pair hear each other again.
    pub fn heal(&mut self, a: NodeId, b: NodeId) {
        self.partitioned.remove(&(a, b));
        self.partitioned.remove(&(b, a));
    }

    /// Remove every partition.
    pub fn heal_all(&mut self) {
        self.partitioned.clear();
    }

    /// Whether `from` cannot reach `to`.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitioned.contains(&(from, to))
    }

    /// Cut `node` off from all of `others`.
    pub fn isolate(&mut self, node: NodeId, others: impl IntoIterator<Item = NodeId>) {
        for other in others {
            if other != node {
                self.partition(node, other);
            }
        }
    }

    /// Whether any partition is active.
    pub fn is_active(&self) -> bool {
        !self.partitioned.is_empty()
    }
}

/// Frame counters of a simulation run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChaosStats {
    /// Frames handed to the simulated transport.
    pub messages_total: u64,
    /// Frames lost to the loss rate.
    pub messages_dropped: u64,
    /// Frames blocked by a partition.
    pub messages_partitioned: u64,
    /// Frames delivered with added latency.
    pub messages_delayed: u64,
}

impl ChaosStats {
    /// Share of frames that arrived.
    pub fn delivery_rate(&self) -> f64 {
        if self.messages_total == 0 {
            return 1.0;
        }
        let lost = self.messages_dropped + self.messages_partitioned;
        (self.messages_total - lost) as f64 / self.messages_total as f64
    }
}

struct SimNode<D: MeshDelegate> {
    mesh: Mesh<D>,
    skew: Duration,
    uplink_available: bool,
    scan_done_at: Option<Timestamp>,
}

struct InFlight {
    to: NodeId,
    conn: ConnectionId,
    bytes: Bytes,
}

type Endpoint = (NodeId, ConnectionId);

/// A simulated radio neighbourhood of mesh nodes.
pub struct SimNetwork<D: MeshDelegate> {
    now: Timestamp,
    step: Duration,
    rng: StdRng,
    nodes: BTreeMap<NodeId, SimNode<D>>,
    radio: HashMap<(NodeId, NodeId), i8>,
    links: HashMap<Endpoint, Endpoint>,
    in_flight: BTreeMap<(Timestamp, u64), InFlight>,
    seq: u64,
    chaos: ChaosConfig,
    partition: NetworkPartition,
    stats: ChaosStats,
}

fn radio_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl<D: MeshDelegate> SimNetwork<D> {
    /// Empty network at virtual time zero.
    pub fn new(seed: u64) -> Self {
        Self {
            now: Timestamp::ZERO,
            step: DEFAULT_STEP,
            rng: StdRng::seed_from_u64(seed),
            nodes: BTreeMap::new(),
            radio: HashMap::new(),
            links: HashMap::new(),
            in_flight: BTreeMap::new(),
            seq: 0,
            chaos: ChaosConfig::default(),
            partition: NetworkPartition::new(),
            stats: ChaosStats::default(),
        }
    }

    /// Use `chaos` for every frame.
    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }

    /// Advance virtual time by `step` per iteration.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step.max(Duration::from_micros(1));
        self
    }

    /// Replace the chaos configuration.
    pub fn set_chaos(&mut self, chaos: ChaosConfig) {
        self.chaos = chaos;
    }

    /// The partition table.
    pub fn partition(&mut self) -> &mut NetworkPartition {
        &mut self.partition
    }

    /// Frame counters so far.
    pub fn stats(&self) -> ChaosStats {
        self.stats
    }

    /// Current virtual time.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Add a node. It boots at the current virtual time, with its uplink
    /// reachable and no clock skew.
    pub fn add_node(&mut self, mesh: Mesh<D>) -> NodeId {
        let id = mesh.id();
        self.nodes.insert(
            id,
            SimNode {
                mesh,
                skew: Duration::ZERO,
                uplink_available: true,
                scan_done_at: None,
            },
        );
        id
    }

    /// Run `node`'s clock `skew` ahead of virtual time.
    pub fn set_clock_skew(&mut self, node: NodeId, skew: Duration) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.skew = skew;
        }
    }

    /// Whether uplink bring-up succeeds for `node`.
    pub fn set_uplink(&mut self, node: NodeId, available: bool) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.uplink_available = available;
        }
    }

    /// Put two nodes in radio range with signal `rssi`.
    pub fn set_in_range(&mut self, a: NodeId, b: NodeId, rssi: i8) {
        if a != b {
            self.radio.insert(radio_key(a, b), rssi);
        }
    }

    /// Take two nodes out of radio range. Existing links stay up.
    pub fn set_out_of_range(&mut self, a: NodeId, b: NodeId) {
        self.radio.remove(&radio_key(a, b));
    }

    /// Put every pair of current nodes in range.
    pub fn connect_all(&mut self, rssi: i8) {
        let ids = self.node_ids();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                self.set_in_range(*a, *b, rssi);
            }
        }
    }

    /// Put consecutive nodes of `ids` in range, forming a line.
    pub fn chain(&mut self, ids: &[NodeId], rssi: i8) {
        for pair in ids.windows(2) {
            self.set_in_range(pair[0], pair[1], rssi);
        }
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// A node.
    pub fn node(&self, id: NodeId) -> Option<&Mesh<D>> {
        self.nodes.get(&id).map(|n| &n.mesh)
    }

    /// A node, mutably.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Mesh<D>> {
        self.nodes.get_mut(&id).map(|n| &mut n.mesh)
    }

    /// The node's own clock reading.
    pub fn local_time(&self, id: NodeId) -> Timestamp {
        let skew = self.nodes.get(&id).map_or(Duration::ZERO, |n| n.skew);
        self.now + skew
    }

    /// Power `id` off. Its neighbours see their links close.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Mesh<D>> {
        let node = self.nodes.remove(&id)?;
        let endpoints: Vec<Endpoint> = self
            .links
            .keys()
            .filter(|(owner, _)| *owner == id)
            .copied()
            .collect();
        for endpoint in endpoints {
            if let Some(remote) = self.links.remove(&endpoint) {
                self.links.remove(&remote);
                self.notify_closed(remote);
            }
        }
        tracing::info!(node = %id, "simulated node powered off");
        Some(node.mesh)
    }

    /// Open links, counted once per pair.
    pub fn link_count(&self) -> usize {
        self.links.len() / 2
    }

    /// Nodes currently acting as bridge.
    pub fn bridges(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.mesh.is_bridge())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether every node sees every other node in its tree.
    pub fn is_converged(&self) -> bool {
        let ids = self.node_ids();
        self.nodes.values().all(|n| {
            let tree = n.mesh.tree();
            tree.size() == ids.len() && ids.iter().all(|id| tree.contains(*id))
        })
    }

    /// Run for `duration` of virtual time.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.step();
        }
    }

    /// Step until `done` holds or `limit` passes. Returns whether `done`
    /// was reached.
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let end = self.now + limit;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Advance one step.
    pub fn step(&mut self) {
        self.now = self.now + self.step;
        for id in self.node_ids() {
            self.complete_scan(id);
        }
        for id in self.node_ids() {
            let local = self.local_time(id);
            if let Some(n) = self.nodes.get_mut(&id) {
                if n.mesh.next_deadline(local).is_some_and(|at| at <= local) {
                    n.mesh.tick(local);
                }
            }
        }
        self.settle();
    }

    /// Process actions and deliver frames until nothing is left for now.
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut progressed = false;
            for id in self.node_ids() {
                progressed |= self.drive_actions(id);
            }
            progressed |= self.collect_transmits();
            progressed |= self.deliver_due();
            if !progressed {
                return;
            }
        }
        tracing::debug!(now = %self.now, "settle round limit reached");
    }

    fn drive_actions(&mut self, id: NodeId) -> bool {
        let mut any = false;
        while let Some(action) = self.nodes.get_mut(&id).and_then(|n| n.mesh.poll_action()) {
            any = true;
            match action {
                LifecycleAction::StartScan => self.start_scan(id),
                LifecycleAction::Connect { node, .. } => self.open_link(id, node),
                LifecycleAction::Disconnect { conn, reason } => {
                    tracing::trace!(node = %id, conn = %conn, reason, "simulated link closed");
                    if let Some(remote) = self.links.remove(&(id, conn)) {
                        self.links.remove(&remote);
                        self.notify_closed(remote);
                    }
                }
                LifecycleAction::ReacquireChannel => {
                    tracing::trace!(node = %id, "channel re-acquisition requested");
                }
                LifecycleAction::StartUplink => {
                    let local = self.local_time(id);
                    if let Some(n) = self.nodes.get_mut(&id) {
                        let ok = n.uplink_available;
                        n.mesh.on_uplink_status(local, ok);
                    }
                }
            }
        }
        any
    }

    fn start_scan(&mut self, id: NodeId) {
        let min = SCAN_DURATION_MIN.as_micros() as u64;
        let max = SCAN_DURATION_MAX.as_micros() as u64;
        let took = Duration::from_micros(self.rng.random_range(min..=max));
        let done = self.now + took;
        if let Some(n) = self.nodes.get_mut(&id) {
            n.scan_done_at.get_or_insert(done);
        }
    }

    fn complete_scan(&mut self, id: NodeId) {
        let due = self
            .nodes
            .get(&id)
            .and_then(|n| n.scan_done_at)
            .is_some_and(|at| at <= self.now);
        if !due {
            return;
        }
        let results = self.scan_results(id);
        let local = self.local_time(id);
        if let Some(n) = self.nodes.get_mut(&id) {
            n.scan_done_at = None;
            n.mesh.on_scan_complete(local, results);
        }
    }

    fn scan_results(&self, id: NodeId) -> Vec<ScanResult> {
        self.nodes
            .iter()
            .filter(|(other, _)| **other != id)
            .filter(|(other, _)| !self.partition.is_partitioned(id, **other))
            .filter_map(|(other, n)| {
                let rssi = *self.radio.get(&radio_key(id, *other))?;
                Some(ScanResult {
                    mesh_name: n.mesh.config().mesh_name.clone(),
                    node_id: *other,
                    rssi,
                    channel: n.mesh.config().channel.max(1),
                })
            })
            .collect()
    }

    fn open_link(&mut self, from: NodeId, to: NodeId) {
        let reachable = self.radio.contains_key(&radio_key(from, to))
            && !self.partition.is_partitioned(from, to)
            && self.nodes.get(&to).is_some_and(|n| {
                n.mesh.connections().len() < n.mesh.config().max_connections
            });

        let from_local = self.local_time(from);
        if !reachable {
            if let Some(n) = self.nodes.get_mut(&from) {
                n.mesh.on_connect_failed(from_local, to);
            }
            return;
        }

        let to_local = self.local_time(to);
        let Some(station) = self
            .nodes
            .get_mut(&from)
            .map(|n| n.mesh.on_connected(from_local, Direction::Station, Some(to)))
        else {
            return;
        };
        let Some(access_point) = self
            .nodes
            .get_mut(&to)
            .map(|n| n.mesh.on_connected(to_local, Direction::AccessPoint, None))
        else {
            return;
        };
        self.links.insert((from, station), (to, access_point));
        self.links.insert((to, access_point), (from, station));
        tracing::trace!(%from, %to, "simulated link opened");
    }

    fn notify_closed(&mut self, (node, conn): Endpoint) {
        let local = self.local_time(node);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.mesh.on_disconnected(local, conn);
        }
    }

    fn collect_transmits(&mut self) -> bool {
        let mut any = false;
        for id in self.node_ids() {
            let frames = match self.nodes.get_mut(&id) {
                Some(n) => n.mesh.poll_transmit(usize::MAX),
                None => continue,
            };
            for (conn, frame) in frames {
                any = true;
                let Some(&(to, remote_conn)) = self.links.get(&(id, conn)) else {
                    continue;
                };
                self.stats.messages_total += 1;
                if self.partition.is_partitioned(id, to) {
                    self.stats.messages_partitioned += 1;
                    continue;
                }
                if self.chaos.should_drop(&mut self.rng) {
                    self.stats.messages_dropped += 1;
                    continue;
                }
                let latency = self.chaos.get_latency(&mut self.rng);
                if latency > Duration::ZERO {
                    self.stats.messages_delayed += 1;
                }
                self.seq += 1;
                self.in_flight.insert(
                    (self.now + latency, self.seq),
                    InFlight {
                        to,
                        conn: remote_conn,
                        bytes: frame.encode_to_bytes(),
                    },
                );
            }
        }
        any
    }

    fn deliver_due(&mut self) -> bool {
        let mut any = false;
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let frame = entry.remove();
            any = true;
            let local = self.local_time(frame.to);
            if let Some(n) = self.nodes.get_mut(&frame.to) {
                if let Err(err) = n.mesh.handle_bytes(local, frame.conn, &frame.bytes) {
                    tracing::trace!(node = %frame.to, error = %err, "frame for a closed link");
                }
            }
        }
        any
    }
}

impl<D: MeshDelegate> std::fmt::Debug for SimNetwork<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("now", &self.now)
            .field("nodes", &self.nodes.len())
            .field("links", &self.link_count())
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::mesh::NoopDelegate;

    fn sim_with(ids: &[u32]) -> SimNetwork<NoopDelegate> {
        let config = MeshConfig::fast_failover()
            .with_mesh("sim", "pw")
            .with_rng_seed(3);
        let mut sim = SimNetwork::new(11);
        for id in ids {
            let mesh = Mesh::new(NodeId::new(*id), config.clone(), NoopDelegate).unwrap();
            sim.add_node(mesh);
        }
        sim
    }

    #[test]
    fn test_network_partition() {
        let mut partition = NetworkPartition::new();
        let (a, b, c) = (NodeId::new(1), NodeId::new(2), NodeId::new(3));
        assert!(!partition.is_active());

        partition.partition(a, b);
        assert!(partition.is_partitioned(a, b));
        assert!(partition.is_partitioned(b, a));
        assert!(!partition.is_partitioned(a, c));

        partition.heal(b, a);
        assert!(!partition.is_partitioned(a, b));
        assert!(!partition.is_active());
    }

    #[test]
    fn test_network_partition_isolate() {
        let mut partition = NetworkPartition::new();
        let ids: Vec<NodeId> = (1..=4).map(NodeId::new).collect();
        partition.isolate(ids[0], ids.clone());
        assert!(partition.is_partitioned(ids[0], ids[3]));
        assert!(!partition.is_partitioned(ids[1], ids[2]));
        partition.heal_all();
        assert!(!partition.is_active());
    }

    #[test]
    fn test_chaos_latency_bounds() {
        let config = ChaosConfig::new()
            .with_latency(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..100 {
            let latency = config.get_latency(&mut rng);
            assert!(latency >= Duration::from_millis(100));
            assert!(latency <= Duration::from_millis(150));
        }
        assert_eq!(ChaosConfig::new().get_latency(&mut rng), Duration::ZERO);
        assert!(!ChaosConfig::new().should_drop(&mut rng));
    }

    #[test]
    fn test_chaos_stats_delivery_rate() {
        let stats = ChaosStats {
            messages_total: 10,
            messages_dropped: 1,
            messages_partitioned: 1,
            messages_delayed: 0,
        };
        assert_eq!(stats.delivery_rate(), 0.8);
        assert_eq!(ChaosStats::default().delivery_rate(), 1.0);
    }

    #[test]
    fn test_two_nodes_link_up() {
        let mut sim = sim_with(&[1, 2]);
        sim.connect_all(-40);
        assert!(sim.run_until(Duration::from_secs(20), |s| {
            s.is_converged() && s.link_count() == 1
        }));
        let route = sim.node(NodeId::new(1)).unwrap().route(NodeId::new(2));
        assert_eq!(route.map(|r| r.hop_count), Some(1));
        assert!(sim.stats().messages_total > 0);
    }

    #[test]
    fn test_out_of_range_nodes_stay_apart() {
        let mut sim = sim_with(&[1, 2]);
        sim.run_for(Duration::from_secs(10));
        assert_eq!(sim.link_count(), 0);
        assert!(!sim.is_converged());
    }

    #[test]
    fn test_removed_node_closes_neighbour_links() {
        let mut sim = sim_with(&[1, 2]);
        sim.connect_all(-40);
        assert!(sim.run_until(Duration::from_secs(20), |s| s.is_converged()));

        let removed = sim.remove_node(NodeId::new(2));
        assert!(removed.is_some());
        assert_eq!(sim.link_count(), 0);
        let survivor = sim.node(NodeId::new(1)).unwrap();
        assert!(survivor.connections().is_empty());
        assert_eq!(survivor.tree().size(), 1);
    }
}
