//! The mesh node.
//!
//! [`Mesh`] owns every component of one node and is driven from outside:
//! the embedding runtime feeds it time, scan results, transport events and
//! received frames, and drains the frames and radio actions it produces.
//! Nothing in here performs I/O or reads a clock, so many nodes can run
//! side by side in one process (see [`crate::testing`]).
//!
//! ```text
//!   driver                               Mesh
//!   ──────                               ────
//!   tick(now) ─────────────────────────▶ scheduler turn
//!   on_scan_complete(results) ─────────▶ lifecycle ─┐
//!   on_connected / on_disconnected ────▶ connections├─▶ poll_action()
//!   handle_frame(conn, frame) ─────────▶ topology, time sync, bridges,
//!                                        election, offline queue
//!   poll_transmit() ◀─────────────────── per-connection priority queues
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bridge::{BridgeEvent, BridgeSelectionStrategy, BridgeTracker};
use crate::config::MeshConfig;
use crate::connection::{ConnectionTable, Direction, LinkState};
use crate::election::{ElectionAction, ElectionCoordinator, ElectionInputs, ElectionState};
use crate::error::{Error, Result};
use crate::health::{HealthReport, HealthReportBuilder};
use crate::lifecycle::{LifecycleAction, LifecycleController, LinkView, ScanResult};
use crate::message::{
    BridgeRole, BridgeStatus, ControlMessage, Coordination, Frame, HandlerRegistry, MessageType,
    Routing, Takeover, TimeSyncMsg, UplinkData,
};
#[cfg(feature = "metrics")]
use crate::metrics;
use crate::priority::MessagePriority;
use crate::queue::{MessageQueue, QueueState, QueuedMessage};
use crate::router::{Route, Router};
use crate::scheduler::Scheduler;
use crate::storage::QueueStore;
use crate::time_sync::{self, SideInfo, TimeSynchronizer};
use crate::topology::{MergeOutcome, NodeTree, TopologyManager, TreeSnapshot};
use crate::types::{ConnectionId, NodeId, Timestamp};

/// How often links are checked for due syncs and timeouts.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between multi-bridge coordination announcements.
pub const COORDINATION_INTERVAL: Duration = Duration::from_secs(30);

const ACCESS_POINT_FIRST_SYNC: Duration = Duration::from_secs(10);

/// Observer of mesh events.
///
/// Every method has a no-op default. Callbacks run synchronously inside
/// the mesh; do not block in them.
#[auto_impl::auto_impl(Box, Arc)]
pub trait MeshDelegate: Send + Sync + 'static {
    /// A `SINGLE`/`BROADCAST` or unhandled application message arrived.
    fn on_receive(&self, _from: NodeId, _msg_type: u16, _body: &Bytes) {}

    /// A neighbour completed the handshake.
    fn on_new_connection(&self, _node: NodeId) {}

    /// An established neighbour went away.
    ///
    /// `station` is true when it was our parent.
    fn on_dropped_connection(&self, _node: NodeId, _station: bool) {}

    /// The local tree view changed.
    fn on_changed_connections(&self) {}

    /// The mesh clock was adjusted by `adjustment` microseconds.
    fn on_node_time_adjusted(&self, _adjustment: i64) {}

    /// A delay measurement to `node` finished.
    fn on_node_delay_received(&self, _node: NodeId, _delay_us: u64) {}

    /// A bridge appeared, disappeared or the primary bridge changed.
    fn on_bridge_changed(&self, _event: &BridgeEvent) {}

    /// This node gained or lost the bridge role. Also called with
    /// `is_bridge == false` when an election declines to promote this node.
    fn on_role_changed(&self, _is_bridge: bool, _reason: &str) {}

    /// The offline queue crossed a fill level.
    fn on_queue_state(&self, _state: QueueState, _len: usize) {}

    /// Hand a message to the uplink. Only called on an internet-connected
    /// bridge; returning `false` keeps the message queued for a retry.
    fn on_uplink(&self, _msg: &QueuedMessage) -> bool {
        false
    }
}

/// Delegate that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl MeshDelegate for NoopDelegate {}

/// Uplink role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Regular mesh node.
    Node,
    /// Uplink bring-up in progress after a promotion.
    Promoting,
    /// Acting as bridge.
    Bridge,
}

#[derive(Debug, Clone, PartialEq)]
enum MeshTask {
    Housekeeping,
    ElectionMonitor,
    QueueDrain,
    BridgeStatus,
    BridgeCoordination,
    PromoteToBridge { reason: &'static str },
    PromotionDeadline,
    RevertToNode { reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
struct PendingPromotion {
    reason: &'static str,
    previous: NodeId,
}

/// One mesh node.
pub struct Mesh<D: MeshDelegate> {
    id: NodeId,
    config: MeshConfig,
    delegate: D,
    rng: StdRng,

    connections: ConnectionTable,
    topology: TopologyManager,
    router: Router,
    clock: TimeSynchronizer,
    lifecycle: LifecycleController,
    bridges: BridgeTracker,
    election: ElectionCoordinator,
    queue: MessageQueue,
    handlers: HandlerRegistry,
    scheduler: Scheduler<MeshTask>,
    actions: VecDeque<LifecycleAction>,

    role: Role,
    internet_connected: bool,
    promotion: Option<PendingPromotion>,
    last_primary: Option<NodeId>,
    election_wakeup: Option<Timestamp>,

    router_rssi: i8,
    router_channel: u8,
    free_memory: u32,
    gateway: String,
    bridge_priority: u8,
}

impl<D: MeshDelegate> Mesh<D> {
    /// Create a node with an in-memory offline queue.
    pub fn new(id: NodeId, config: MeshConfig, delegate: D) -> Result<Self> {
        Self::build(id, config, delegate, None)
    }

    /// Create a node whose offline queue is mirrored to `store`.
    ///
    /// Persisted entries are replayed before the node starts.
    pub fn with_store(
        id: NodeId,
        config: MeshConfig,
        delegate: D,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self> {
        Self::build(id, config, delegate, Some(store))
    }

    fn build(
        id: NodeId,
        config: MeshConfig,
        delegate: D,
        store: Option<Arc<dyn QueueStore>>,
    ) -> Result<Self> {
        config.validate()?;
        if id.is_none() {
            return Err(Error::Config("node id must be non-zero".into()));
        }

        let queue = match store {
            Some(store) => MessageQueue::with_store(config.queue.clone(), store)?,
            None => MessageQueue::new(config.queue.clone()),
        };
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(u64::from(id.get()))),
            None => StdRng::from_os_rng(),
        };
        let topology = TopologyManager::new(id);
        let router = Router::new(&topology.current_tree());

        let mut mesh = Self {
            id,
            rng,
            connections: ConnectionTable::new(),
            router,
            topology,
            clock: TimeSynchronizer::new(config.time_smoothing),
            lifecycle: LifecycleController::new(&config),
            bridges: BridgeTracker::new(config.bridge_timeout),
            election: ElectionCoordinator::new(
                id,
                config.election.clone(),
                config.uplink.is_some(),
            ),
            queue,
            handlers: HandlerRegistry::new(),
            scheduler: Scheduler::new(),
            actions: VecDeque::new(),
            role: Role::Node,
            internet_connected: false,
            promotion: None,
            last_primary: None,
            election_wakeup: None,
            router_rssi: 0,
            router_channel: 0,
            free_memory: 0,
            gateway: String::new(),
            bridge_priority: crate::bridge::DEFAULT_BRIDGE_PRIORITY,
            config,
            delegate,
        };
        mesh.install_tasks(Timestamp::ZERO);
        mesh.emit_queue_events();
        tracing::info!(node = %id, mesh = %mesh.config.mesh_name, "mesh node created");
        Ok(mesh)
    }

    // ----- accessors -------------------------------------------------------

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Active configuration.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The delegate.
    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Current uplink role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this node is the bridge.
    pub fn is_bridge(&self) -> bool {
        self.role == Role::Bridge
    }

    /// Live connections.
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// The topology manager.
    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Current tree snapshot.
    pub fn tree(&self) -> TreeSnapshot {
        self.topology.current_tree()
    }

    /// Routing table for the current snapshot.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Route to `dest`, `None` when unreachable.
    pub fn route(&self, dest: NodeId) -> Option<Route> {
        self.router.route(dest)
    }

    /// Known bridges.
    pub fn bridges(&self) -> &BridgeTracker {
        &self.bridges
    }

    /// Election state and history.
    pub fn election(&self) -> &ElectionCoordinator {
        &self.election
    }

    /// The offline queue.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// The mesh clock.
    pub fn clock(&self) -> &TimeSynchronizer {
        &self.clock
    }

    /// The lifecycle controller.
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Mesh time for a local clock reading, microseconds.
    pub fn mesh_time(&self, now: Timestamp) -> u64 {
        self.clock.mesh_time(now)
    }

    // ----- local radio facts ---------------------------------------------

    /// Signal of the uplink router as seen by this node, `0` if not visible.
    pub fn set_router_rssi(&mut self, rssi: i8) {
        self.router_rssi = rssi;
    }

    /// Channel of the uplink router.
    pub fn set_router_channel(&mut self, channel: u8) {
        self.router_channel = channel;
    }

    /// Free memory estimate used as an election tiebreak.
    pub fn set_free_memory(&mut self, bytes: u32) {
        self.free_memory = bytes;
    }

    /// Gateway address reported while acting as bridge.
    pub fn set_gateway(&mut self, gateway: impl Into<String>) {
        self.gateway = gateway.into();
    }

    /// Priority announced while acting as bridge, `1..=10`.
    pub fn set_bridge_priority(&mut self, priority: u8) {
        self.bridge_priority = priority.clamp(1, 10);
    }

    /// Strategy for picking the bridge uplink messages go to.
    pub fn set_bridge_strategy(&mut self, strategy: BridgeSelectionStrategy) {
        self.bridges.set_strategy(strategy);
    }

    // ----- driver surface --------------------------------------------------

    /// Run one scheduler turn.
    pub fn tick(&mut self, now: Timestamp) {
        let due = self.scheduler.begin_turn(now);
        for task in due {
            self.run_task(now, task);
        }
        self.scheduler.end_turn();
    }

    /// When [`tick`](Self::tick) next has work to do.
    pub fn next_deadline(&self, now: Timestamp) -> Option<Timestamp> {
        self.scheduler.next_deadline(now)
    }

    /// Next radio action for the driver.
    pub fn poll_action(&mut self) -> Option<LifecycleAction> {
        self.actions.pop_front()
    }

    /// Frames ready to go out, up to `max_per_connection` per link.
    pub fn poll_transmit(&mut self, max_per_connection: usize) -> Vec<(ConnectionId, Frame)> {
        let mut out = Vec::new();
        for conn in self.connections.iter_mut() {
            let id = conn.id();
            out.extend(conn.drain(max_per_connection).into_iter().map(|f| (id, f)));
        }
        out
    }

    /// A scan finished.
    pub fn on_scan_complete(&mut self, now: Timestamp, mut results: Vec<ScanResult>) {
        results.retain(|r| self.connections.find_peer(r.node_id).is_none());
        let snapshot = self.topology.current_tree();
        let view = LinkView {
            tree: &snapshot,
            station: self.connections.station(),
            connections: self.connections.len(),
        };
        let actions = self.lifecycle.on_scan_complete(now, results, view, &mut self.rng);
        for action in actions {
            self.apply_lifecycle_action(now, action);
        }
    }

    /// A transport connection came up.
    ///
    /// `peer` is known for station links (from the scan) and unknown for
    /// links accepted on our access point.
    pub fn on_connected(
        &mut self,
        now: Timestamp,
        direction: Direction,
        peer: Option<NodeId>,
    ) -> ConnectionId {
        let conn = self.connections.insert(direction, peer, now);
        tracing::debug!(node = %self.id, conn = %conn, ?direction, ?peer, "transport connected");
        if let Some(c) = self.connections.get_mut(conn) {
            c.set_state(LinkState::Handshaking);
        }
        match direction {
            Direction::Station => self.send_node_sync(now, conn),
            Direction::AccessPoint => {
                let first = ACCESS_POINT_FIRST_SYNC.min(self.config.node_sync_interval);
                if let Some(c) = self.connections.get_mut(conn) {
                    c.set_next_node_sync(now + first);
                }
            }
        }
        #[cfg(feature = "metrics")]
        metrics::set_connections(self.connections.len());
        conn
    }

    /// A connection attempt to `node` failed.
    pub fn on_connect_failed(&mut self, now: Timestamp, node: NodeId) {
        tracing::debug!(node = %self.id, peer = %node, "connection attempt failed");
        self.note_connect_failure(now, node);
    }

    /// The transport closed `conn`.
    pub fn on_disconnected(&mut self, now: Timestamp, conn: ConnectionId) {
        self.close_connection(now, conn, "closed by transport", false);
    }

    /// Close `conn` from our side.
    pub fn close(&mut self, now: Timestamp, conn: ConnectionId) -> Result<()> {
        if self.close_connection(now, conn, "closed locally", true) {
            Ok(())
        } else {
            Err(Error::UnknownConnection(conn))
        }
    }

    /// Decode and handle raw bytes received on `conn`.
    pub fn handle_bytes(&mut self, now: Timestamp, conn: ConnectionId, data: &[u8]) -> Result<()> {
        let frame = Frame::decode_from_slice(data)
            .ok_or_else(|| Error::Decode(format!("malformed frame ({} bytes)", data.len())))?;
        self.handle_frame(now, conn, frame)
    }

    /// Handle a frame received on `conn`.
    pub fn handle_frame(&mut self, now: Timestamp, conn: ConnectionId, frame: Frame) -> Result<()> {
        let c = self
            .connections
            .get_mut(conn)
            .ok_or(Error::UnknownConnection(conn))?;
        if c.state() == LinkState::Closing {
            return Ok(());
        }
        c.touch(now);
        let established = c.is_established();

        #[cfg(feature = "metrics")]
        metrics::record_frame_received();

        let is_node_sync = matches!(
            frame.msg_type,
            MessageType::NODE_SYNC_REQUEST | MessageType::NODE_SYNC_REPLY
        );
        if !established && !is_node_sync {
            tracing::trace!(conn = %conn, ty = frame.msg_type, "frame before handshake dropped");
            return Ok(());
        }

        match frame.routing {
            Routing::Neighbour => self.deliver_local(now, conn, &frame),
            Routing::Single if frame.dest == self.id => self.deliver_local(now, conn, &frame),
            Routing::Single => {
                if !self.route_frame(frame) {
                    tracing::debug!(node = %self.id, "no route for forwarded frame");
                }
            }
            Routing::Broadcast => {
                if frame.from == self.id {
                    return Ok(());
                }
                self.flood(frame.clone(), Some(conn));
                self.deliver_local(now, conn, &frame);
            }
        }
        Ok(())
    }

    /// Report the outcome of a requested uplink bring-up, or a later change
    /// of uplink connectivity while acting as bridge.
    pub fn on_uplink_status(&mut self, now: Timestamp, success: bool) {
        match self.role {
            Role::Promoting => self.finish_promotion(now, success),
            Role::Bridge => {
                if self.internet_connected != success {
                    self.internet_connected = success;
                    tracing::info!(node = %self.id, internet = success, "bridge uplink changed");
                    self.broadcast_status(now);
                }
            }
            Role::Node => {
                tracing::debug!(node = %self.id, "uplink status ignored outside bridge role");
            }
        }
    }

    /// Take the bridge role on the next turn, independent of any election.
    pub fn init_as_bridge(&mut self) -> Result<()> {
        if self.config.uplink.is_none() {
            return Err(Error::Config("bridge role requires uplink credentials".into()));
        }
        self.scheduler.defer(MeshTask::PromoteToBridge {
            reason: "configured as bridge",
        });
        Ok(())
    }

    // ----- application surface -------------------------------------------

    /// Register a handler for an application message type.
    pub fn register_handler<F>(&mut self, msg_type: u16, handler: F) -> Result<()>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        self.handlers.register(msg_type, handler)
    }

    /// Remove a handler.
    pub fn unregister_handler(&mut self, msg_type: u16) -> bool {
        self.handlers.unregister(msg_type)
    }

    /// Send a `SINGLE` message to `dest`. Returns whether a route existed.
    pub fn send_single(&mut self, dest: NodeId, body: impl Into<Bytes>) -> bool {
        let frame = Frame::single(MessageType::SINGLE, self.id, dest, body.into());
        dest != self.id && self.route_frame(frame)
    }

    /// Send a `BROADCAST` message. Returns the number of links used.
    pub fn send_broadcast(&mut self, body: impl Into<Bytes>) -> usize {
        let frame = Frame::broadcast(MessageType::BROADCAST, self.id, body.into());
        self.flood(frame, None)
    }

    /// Send an application-typed message to `dest`, or to everyone when
    /// `dest` is `None`. Returns the number of links used.
    pub fn send_typed(
        &mut self,
        msg_type: u16,
        dest: Option<NodeId>,
        body: impl Into<Bytes>,
        priority: MessagePriority,
    ) -> Result<usize> {
        if MessageType::is_reserved(msg_type) {
            return Err(Error::ReservedType(msg_type));
        }
        let body = body.into();
        let sent = match dest {
            Some(dest) if dest == self.id => 0,
            Some(dest) => {
                let frame = Frame::single(msg_type, self.id, dest, body).with_priority(priority);
                usize::from(self.route_frame(frame))
            }
            None => {
                let frame = Frame::broadcast(msg_type, self.id, body).with_priority(priority);
                self.flood(frame, None)
            }
        };
        Ok(sent)
    }

    /// Queue a message for the uplink.
    ///
    /// It is drained toward the selected bridge as soon as one is
    /// reachable.
    pub fn enqueue_uplink(
        &mut self,
        now: Timestamp,
        payload: impl Into<Bytes>,
        destination: impl Into<String>,
        priority: MessagePriority,
    ) -> Result<u32> {
        #[cfg(feature = "metrics")]
        let evicted_before = self.queue.stats().total_evicted;
        let result = self
            .queue
            .enqueue(payload.into(), destination, priority, now);
        #[cfg(feature = "metrics")]
        {
            match &result {
                Ok(_) => metrics::record_queue_enqueued(),
                Err(_) => metrics::record_queue_dropped(1),
            }
            metrics::record_queue_evicted(self.queue.stats().total_evicted - evicted_before);
        }
        self.emit_queue_events();
        result
    }

    /// Drop queued messages older than `max_age`.
    pub fn prune_queue(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let pruned = self.queue.prune(now, max_age);
        self.emit_queue_events();
        pruned
    }

    /// Measure the one-way delay to `node`. The result arrives through
    /// [`MeshDelegate::on_node_delay_received`].
    pub fn start_delay_measure(&mut self, now: Timestamp, node: NodeId) -> bool {
        let t0 = self.clock.mesh_time(now);
        let body = ControlMessage::TimeDelay(TimeSyncMsg::Request { t0 }).encode();
        let frame = Frame::single(MessageType::TIME_DELAY, self.id, node, body)
            .with_priority(MessagePriority::High);
        self.route_frame(frame)
    }

    /// Current health summary.
    pub fn health(&self, now: Timestamp) -> HealthReport {
        HealthReportBuilder::new()
            .connections(
                self.connections.len(),
                self.connections.established().len(),
                self.config.max_connections,
            )
            .known_nodes(self.topology.current_tree().size())
            .bridge(
                self.role == Role::Bridge,
                self.bridges.primary_bridge(now).map(|b| b.node_id),
                self.bridges.healthy_bridges(now).len(),
            )
            .election_running(self.election.state().is_running())
            .queue(self.queue.len(), self.queue.capacity(), self.queue.state())
            .at(now)
            .build()
    }

    // ----- tasks ------------------------------------------------------------

    fn install_tasks(&mut self, now: Timestamp) {
        self.scheduler.clear();
        self.election_wakeup = None;
        self.scheduler
            .every(MeshTask::Housekeeping, HOUSEKEEPING_INTERVAL, now);
        self.scheduler.every(
            MeshTask::ElectionMonitor,
            self.config.election.monitor_interval,
            now,
        );
        let drain = self.config.queue.drain_interval;
        self.scheduler.every(MeshTask::QueueDrain, drain, now + drain);
        if self.role == Role::Bridge {
            let status = self.config.bridge_status_interval;
            self.scheduler
                .every(MeshTask::BridgeStatus, status, now + status);
            self.scheduler.every(
                MeshTask::BridgeCoordination,
                COORDINATION_INTERVAL,
                now + COORDINATION_INTERVAL,
            );
        }
    }

    fn run_task(&mut self, now: Timestamp, task: MeshTask) {
        match task {
            MeshTask::Housekeeping => self.housekeeping(now),
            MeshTask::ElectionMonitor => self.monitor_election(now),
            MeshTask::QueueDrain => self.drain_queue(now),
            MeshTask::BridgeStatus => self.broadcast_status(now),
            MeshTask::BridgeCoordination => self.broadcast_coordination(now),
            MeshTask::PromoteToBridge { reason } => self.promote(now, reason),
            MeshTask::PromotionDeadline => {
                if self.role == Role::Promoting {
                    tracing::warn!(node = %self.id, "no uplink status before the deadline");
                    self.finish_promotion(now, false);
                }
            }
            MeshTask::RevertToNode { reason } => self.revert(now, reason),
        }
    }

    fn housekeeping(&mut self, now: Timestamp) {
        if let Some(action) = self.lifecycle.poll(now) {
            self.actions.push_back(action);
        }

        let timeout = self.config.node_timeout;
        for conn in self.connections.ids() {
            let Some(c) = self.connections.get(conn) else {
                continue;
            };
            if !c.is_established() {
                if now.saturating_duration_since(c.created_at()) >= timeout {
                    let peer = c.peer();
                    tracing::warn!(node = %self.id, conn = %conn, ?peer, "handshake timed out");
                    self.close_connection(now, conn, "handshake timeout", true);
                    if let Some(peer) = peer {
                        self.note_connect_failure(now, peer);
                    }
                }
                continue;
            }
            if c.sync_deadline().is_some_and(|deadline| now >= deadline) {
                tracing::warn!(node = %self.id, conn = %conn, peer = ?c.peer(), "node sync timed out");
                self.close_connection(now, conn, "node sync timeout", true);
                continue;
            }
            let sync_due = now >= c.next_node_sync();
            let time_due =
                c.direction() == Direction::Station && c.time_sync.is_due(now, timeout);
            if sync_due {
                self.send_node_sync(now, conn);
            }
            if time_due {
                self.start_time_sync(now, conn);
            }
        }
    }

    // ----- connections and topology ------------------------------------------

    fn apply_lifecycle_action(&mut self, now: Timestamp, action: LifecycleAction) {
        match action {
            LifecycleAction::Disconnect { conn, reason } => {
                self.close_connection(now, conn, reason, true);
            }
            LifecycleAction::Connect { .. } if self.role != Role::Node => {
                tracing::trace!(node = %self.id, "bridge does not join as station");
            }
            other => self.actions.push_back(other),
        }
    }

    fn note_connect_failure(&mut self, now: Timestamp, node: NodeId) {
        if self.lifecycle.on_connect_failed(now, node) {
            #[cfg(feature = "metrics")]
            metrics::record_blocklisted();
        }
    }

    fn close_connection(
        &mut self,
        now: Timestamp,
        conn: ConnectionId,
        reason: &'static str,
        notify_driver: bool,
    ) -> bool {
        let Some(mut c) = self.connections.remove(conn) else {
            return false;
        };
        let was_established = c.is_established();
        c.set_state(LinkState::Closing);
        let station = c.direction() == Direction::Station;
        tracing::info!(node = %self.id, conn = %conn, peer = ?c.peer(), reason, "connection closed");

        if notify_driver {
            self.actions
                .push_back(LifecycleAction::Disconnect { conn, reason });
        }
        let pruned = self.topology.remove_link(conn).is_some();
        self.lifecycle
            .on_disconnected(now, c.peer().filter(|_| station));

        #[cfg(feature = "metrics")]
        {
            metrics::record_connection_dropped();
            metrics::set_connections(self.connections.len());
        }

        if was_established {
            if let Some(peer) = c.peer() {
                self.delegate.on_dropped_connection(peer, station);
            }
        }
        if pruned {
            self.on_topology_changed(now, None);
        }
        true
    }

    fn send_node_sync(&mut self, now: Timestamp, conn: ConnectionId) {
        let report = self.topology.report_for(conn);
        self.send_control(conn, ControlMessage::NodeSyncRequest(report));
        if let Some(c) = self.connections.get_mut(conn) {
            if c.sync_deadline().is_none() {
                c.arm_sync_deadline(now + self.config.node_timeout);
            }
            c.set_next_node_sync(now + self.config.node_sync_interval);
        }
    }

    fn on_node_sync(&mut self, now: Timestamp, conn: ConnectionId, report: NodeTree, request: bool) {
        let Some(c) = self.connections.get(conn) else {
            return;
        };
        let expected = c.peer();
        let was_established = c.is_established();
        let direction = c.direction();
        let peer = report.node_id;

        let changed = match self.topology.merge_subtree(conn, report, expected) {
            MergeOutcome::Loop { node } => {
                tracing::warn!(node = %self.id, conn = %conn, duplicate = %node, "loop in topology report");
                self.close_connection(now, conn, "topology loop", true);
                return;
            }
            MergeOutcome::PeerMismatch { expected, got } => {
                tracing::warn!(node = %self.id, conn = %conn, %expected, %got, "unexpected peer in handshake");
                self.close_connection(now, conn, "peer mismatch", true);
                self.note_connect_failure(now, expected);
                return;
            }
            MergeOutcome::Updated => true,
            MergeOutcome::Unchanged => false,
        };

        if let Some(c) = self.connections.get_mut(conn) {
            c.clear_sync_deadline();
            if !was_established {
                c.set_peer(peer);
                c.set_state(LinkState::Established);
            }
        }
        if !was_established {
            tracing::info!(node = %self.id, peer = %peer, conn = %conn, ?direction, "connection established");
            if direction == Direction::Station {
                self.lifecycle.on_connected(peer);
            }
            #[cfg(feature = "metrics")]
            metrics::record_connection_established();
            self.delegate.on_new_connection(peer);
        }

        if request {
            let reply = self.topology.report_for(conn);
            self.send_control(conn, ControlMessage::NodeSyncReply(reply));
        }
        if changed || !was_established {
            self.on_topology_changed(now, Some(conn));
        }
    }

    /// Rebuild routes and push our new view to every other neighbour.
    fn on_topology_changed(&mut self, now: Timestamp, origin: Option<ConnectionId>) {
        let snapshot = self.topology.current_tree();
        if self.router.version() != snapshot.version() {
            self.router = Router::new(&snapshot);
        }
        self.lifecycle.set_contains_root(snapshot.is_rooted());
        tracing::debug!(node = %self.id, nodes = snapshot.size(), "topology changed");

        #[cfg(feature = "metrics")]
        metrics::set_known_nodes(snapshot.size());

        self.delegate.on_changed_connections();
        for conn in self.connections.established() {
            if Some(conn) != origin {
                self.send_node_sync(now, conn);
            }
        }
    }

    // ----- sending ------------------------------------------------------------

    fn send_on(&mut self, conn: ConnectionId, frame: Frame) -> bool {
        let queued = self
            .connections
            .get_mut(conn)
            .is_some_and(|c| c.enqueue(frame));
        #[cfg(feature = "metrics")]
        if queued {
            metrics::record_frame_sent();
        }
        queued
    }

    fn send_control(&mut self, conn: ConnectionId, msg: ControlMessage) -> bool {
        let frame = Frame::neighbour(msg.msg_type(), self.id, msg.encode());
        self.send_on(conn, frame)
    }

    fn link_for(&self, dest: NodeId) -> Option<ConnectionId> {
        let next = self.router.next_hop(dest)?;
        let conn = self.topology.link_to(next)?;
        self.connections
            .get(conn)
            .filter(|c| c.is_established())
            .map(|c| c.id())
    }

    fn route_frame(&mut self, frame: Frame) -> bool {
        match self.link_for(frame.dest) {
            Some(conn) => self.send_on(conn, frame),
            None => {
                tracing::debug!(node = %self.id, dest = %frame.dest, ty = frame.msg_type, "destination unreachable");
                #[cfg(feature = "metrics")]
                metrics::record_route_unreachable();
                false
            }
        }
    }

    fn flood(&mut self, frame: Frame, except: Option<ConnectionId>) -> usize {
        let mut sent = 0;
        for conn in self.connections.established() {
            if Some(conn) != except && self.send_on(conn, frame.clone()) {
                sent += 1;
            }
        }
        sent
    }

    fn broadcast_control(&mut self, msg: ControlMessage, priority: MessagePriority) -> usize {
        let frame = Frame::broadcast(msg.msg_type(), self.id, msg.encode()).with_priority(priority);
        self.flood(frame, None)
    }

    // ----- receiving ---------------------------------------------------------

    fn deliver_local(&mut self, now: Timestamp, conn: ConnectionId, frame: &Frame) {
        match frame.msg_type {
            MessageType::SINGLE | MessageType::BROADCAST => {
                self.delegate.on_receive(frame.from, frame.msg_type, &frame.body);
            }
            ty if MessageType::is_reserved(ty) => match ControlMessage::from_frame(frame) {
                Some(msg) => self.on_control(now, conn, frame.from, msg),
                None => {
                    tracing::debug!(node = %self.id, ty, from = %frame.from, "malformed or unknown control message");
                }
            },
            _ => {
                if !self.handlers.dispatch(frame) {
                    self.delegate.on_receive(frame.from, frame.msg_type, &frame.body);
                }
            }
        }
    }

    fn on_control(&mut self, now: Timestamp, conn: ConnectionId, from: NodeId, msg: ControlMessage) {
        match msg {
            ControlMessage::NodeSyncRequest(tree) => self.on_node_sync(now, conn, tree, true),
            ControlMessage::NodeSyncReply(tree) => self.on_node_sync(now, conn, tree, false),
            ControlMessage::TimeSync(m) => self.on_time_sync(now, conn, m),
            ControlMessage::TimeDelay(m) => self.on_time_delay(now, from, m),
            ControlMessage::BridgeStatus(status) => {
                let before = self.last_primary;
                let events = self.bridges.on_bridge_status(from, &status, now);
                self.emit_bridge_events(events);
                if let (Some(lost), Some(current)) = (before, self.last_primary) {
                    if lost != current && !self.bridges.is_healthy(lost, now) {
                        self.election.on_bridge_replaced(current, now);
                    }
                }
            }
            ControlMessage::BridgeElection(candidate) => {
                tracing::debug!(node = %self.id, candidate = %candidate.node_id, rssi = candidate.router_rssi, "candidacy received");
                self.election.on_candidacy(candidate, now);
            }
            ControlMessage::BridgeTakeover(takeover) => {
                tracing::info!(
                    node = %self.id,
                    bridge = %takeover.new_bridge,
                    previous = %takeover.previous_bridge,
                    reason = %takeover.reason,
                    "bridge takeover announced"
                );
                self.election.on_takeover(takeover.new_bridge, now);
            }
            ControlMessage::BridgeCoordination(coordination) => {
                self.bridges.on_coordination(from, &coordination, now);
            }
            ControlMessage::UplinkData(data) => self.on_uplink_data(now, data),
        }
    }

    // ----- time ---------------------------------------------------------------

    /// Both ends of `conn` as seen by the adoption rule.
    fn sides(&self, conn: ConnectionId) -> Option<(SideInfo, SideInfo)> {
        let peer = self.connections.get(conn)?.peer()?;
        let total = self.topology.current_tree().size();
        let theirs_size = self.topology.subtree_size(conn);
        let ours_rooted = self.topology.is_root()
            || self
                .connections
                .established()
                .into_iter()
                .any(|c| c != conn && self.topology.subtree_rooted(c));
        let ours = SideInfo {
            node_id: self.id,
            size: total.saturating_sub(theirs_size),
            rooted: ours_rooted,
        };
        let theirs = SideInfo {
            node_id: peer,
            size: theirs_size,
            rooted: self.topology.subtree_rooted(conn),
        };
        Some((ours, theirs))
    }

    fn start_time_sync(&mut self, now: Timestamp, conn: ConnectionId) {
        let Some((ours, theirs)) = self.sides(conn) else {
            return;
        };
        if time_sync::should_adopt(ours, theirs) {
            self.request_time(now, conn);
        } else if self.send_control(conn, ControlMessage::TimeSync(TimeSyncMsg::Start)) {
            if let Some(c) = self.connections.get_mut(conn) {
                c.time_sync.mark_start_sent(now);
            }
        }
    }

    fn request_time(&mut self, now: Timestamp, conn: ConnectionId) {
        let t0 = self.clock.mesh_time(now);
        if self.send_control(conn, ControlMessage::TimeSync(TimeSyncMsg::Request { t0 })) {
            if let Some(c) = self.connections.get_mut(conn) {
                c.time_sync.mark_request_sent(t0);
            }
        }
    }

    fn on_time_sync(&mut self, now: Timestamp, conn: ConnectionId, msg: TimeSyncMsg) {
        match msg {
            TimeSyncMsg::Start => {
                if let Some((ours, theirs)) = self.sides(conn) {
                    if time_sync::should_adopt(ours, theirs) {
                        self.request_time(now, conn);
                    }
                }
            }
            TimeSyncMsg::Request { t0 } => {
                let t1 = self.clock.mesh_time(now);
                let reply = TimeSyncMsg::Reply { t0, t1, t2: t1 };
                self.send_control(conn, ControlMessage::TimeSync(reply));
                let interval = self.config.time_sync_interval;
                if let Some(c) = self.connections.get_mut(conn) {
                    c.time_sync.mark_responding(now, interval);
                }
            }
            TimeSyncMsg::Reply { t0, t1, t2 } => {
                let accepted = self
                    .connections
                    .get(conn)
                    .is_some_and(|c| c.time_sync.accepts_reply(t0));
                if !accepted {
                    tracing::trace!(node = %self.id, conn = %conn, "stale time reply ignored");
                    return;
                }
                let t3 = self.clock.mesh_time(now);
                let sample = time_sync::offset_sample(t0, t1, t2, t3);
                let adjustment = self.clock.apply(sample);
                let interval = TimeSynchronizer::next_interval(
                    adjustment,
                    self.config.time_sync_interval,
                    self.config.time_sync_fast_interval,
                );
                if let Some(c) = self.connections.get_mut(conn) {
                    c.time_sync.complete(now, adjustment, interval);
                }
                tracing::debug!(
                    node = %self.id,
                    sample,
                    adjustment,
                    offset = self.clock.offset(),
                    "mesh time adjusted"
                );
                #[cfg(feature = "metrics")]
                {
                    metrics::record_time_adjustment(adjustment);
                    metrics::set_time_offset(self.clock.offset());
                }
                self.delegate.on_node_time_adjusted(adjustment);
            }
        }
    }

    fn on_time_delay(&mut self, now: Timestamp, from: NodeId, msg: TimeSyncMsg) {
        match msg {
            TimeSyncMsg::Request { t0 } => {
                let t1 = self.clock.mesh_time(now);
                let reply = TimeSyncMsg::Reply { t0, t1, t2: t1 };
                let body = ControlMessage::TimeDelay(reply).encode();
                let frame = Frame::single(MessageType::TIME_DELAY, self.id, from, body)
                    .with_priority(MessagePriority::High);
                self.route_frame(frame);
            }
            TimeSyncMsg::Reply { t0, t1, t2 } => {
                let t3 = self.clock.mesh_time(now);
                let delay = time_sync::delay_sample(t0, t1, t2, t3);
                tracing::debug!(node = %self.id, peer = %from, delay_us = delay, "delay measured");
                self.delegate.on_node_delay_received(from, delay);
            }
            TimeSyncMsg::Start => {}
        }
    }

    // ----- bridge and election ------------------------------------------------

    fn emit_bridge_events(&mut self, events: Vec<BridgeEvent>) {
        for event in events {
            if let BridgeEvent::PrimaryChanged {
                current: Some(current),
                ..
            } = event
            {
                self.last_primary = Some(current);
            }
            self.delegate.on_bridge_changed(&event);
        }
    }

    fn monitor_election(&mut self, now: Timestamp) {
        let events = self.bridges.check_health(now);
        self.emit_bridge_events(events);

        let inputs = ElectionInputs {
            now,
            bridge_healthy: self.bridges.has_primary(now),
            is_bridge: self.role != Role::Node,
            established: self.connections.established().len(),
            empty_scans: self.lifecycle.empty_scans(),
            router_rssi: self.router_rssi,
            uptime_ms: now.as_millis(),
            free_memory: self.free_memory,
        };
        for action in self.election.tick(inputs, &mut self.rng) {
            match action {
                ElectionAction::Announce(candidate) => {
                    #[cfg(feature = "metrics")]
                    metrics::record_election_started();
                    self.broadcast_control(
                        ControlMessage::BridgeElection(candidate),
                        MessagePriority::High,
                    );
                }
                ElectionAction::Promote { reason } => {
                    #[cfg(feature = "metrics")]
                    metrics::record_election_won();
                    self.scheduler.defer(MeshTask::PromoteToBridge { reason });
                }
                ElectionAction::Decline { reason } => {
                    self.delegate.on_role_changed(false, reason);
                }
            }
        }

        let wakeup = match self.election.state() {
            ElectionState::Candidacy { announce_at } => Some(announce_at),
            ElectionState::Collecting { until } => Some(until),
            _ => None,
        };
        if let Some(at) = wakeup {
            if self.election_wakeup != Some(at) {
                self.scheduler.at(MeshTask::ElectionMonitor, at);
            }
        }
        self.election_wakeup = wakeup;
    }

    /// Take the bridge role. Always runs as deferred work, never from
    /// inside the task that decided on it.
    fn promote(&mut self, now: Timestamp, reason: &'static str) {
        if self.role != Role::Node {
            return;
        }
        let previous = self.last_primary.unwrap_or(NodeId::NONE);
        tracing::info!(node = %self.id, reason, %previous, "promoting to bridge");
        self.role = Role::Promoting;
        self.promotion = Some(PendingPromotion { reason, previous });

        if let Some(station) = self.connections.station() {
            self.close_connection(now, station, "promoted to bridge", true);
        }
        for action in self.lifecycle.reinit_as_bridge() {
            self.actions.push_back(action);
        }
        self.topology.set_root(true);
        self.on_topology_changed(now, None);
        self.install_tasks(now);
        self.scheduler.at(
            MeshTask::PromotionDeadline,
            now + self.config.election.uplink_timeout,
        );
    }

    fn finish_promotion(&mut self, now: Timestamp, success: bool) {
        let Some(promotion) = self.promotion.take() else {
            return;
        };
        #[cfg(feature = "metrics")]
        metrics::record_promotion(success);
        self.election.on_promotion_result(success, now);

        if !success {
            tracing::warn!(node = %self.id, "uplink bring-up failed, reverting to node");
            self.scheduler.defer(MeshTask::RevertToNode {
                reason: "uplink unavailable",
            });
            return;
        }

        self.role = Role::Bridge;
        self.internet_connected = true;
        tracing::info!(node = %self.id, reason = promotion.reason, "acting as bridge");
        self.install_tasks(now);
        let takeover = Takeover {
            new_bridge: self.id,
            previous_bridge: promotion.previous,
            reason: promotion.reason.to_string(),
            router_rssi: self.router_rssi,
            timestamp: self.clock.mesh_time(now) / 1_000,
        };
        self.broadcast_control(ControlMessage::BridgeTakeover(takeover), MessagePriority::High);
        self.broadcast_status(now);
        self.delegate.on_role_changed(true, promotion.reason);
    }

    fn revert(&mut self, now: Timestamp, reason: &'static str) {
        if self.role == Role::Node {
            return;
        }
        tracing::info!(node = %self.id, reason, "reverting to regular node");
        self.role = Role::Node;
        self.internet_connected = false;
        self.promotion = None;
        self.lifecycle.reinit_as_node(now);
        self.topology.set_root(false);
        self.on_topology_changed(now, None);
        if self.bridges.remove(self.id).is_some() {
            let events = self.bridges.check_health(now);
            self.emit_bridge_events(events);
        }
        self.election.note_role_change(now);
        self.install_tasks(now);
        self.delegate.on_role_changed(false, reason);
    }

    fn broadcast_status(&mut self, now: Timestamp) {
        if self.role != Role::Bridge {
            return;
        }
        let status = BridgeStatus {
            internet_connected: self.internet_connected,
            router_rssi: self.router_rssi,
            router_channel: self.router_channel,
            uptime_ms: now.as_millis(),
            gateway: self.gateway.clone(),
            timestamp: self.clock.mesh_time(now) / 1_000,
        };
        let events = self.bridges.on_bridge_status(self.id, &status, now);
        self.emit_bridge_events(events);
        self.broadcast_control(ControlMessage::BridgeStatus(status), MessagePriority::High);
    }

    fn broadcast_coordination(&mut self, now: Timestamp) {
        if self.role != Role::Bridge {
            return;
        }
        let primary = self.bridges.primary_bridge(now).map(|b| b.node_id);
        let role = if primary == Some(self.id) {
            BridgeRole::Primary
        } else {
            BridgeRole::Secondary
        };
        let peer_bridges = self
            .bridges
            .healthy_bridges(now)
            .into_iter()
            .map(|b| b.node_id)
            .filter(|id| *id != self.id)
            .collect();
        let load = (self.connections.len() * 100 / self.config.max_connections).min(100) as u8;
        let coordination = Coordination {
            priority: self.bridge_priority,
            role,
            load,
            peer_bridges,
            timestamp: self.clock.mesh_time(now) / 1_000,
        };
        self.bridges.on_coordination(self.id, &coordination, now);
        self.broadcast_control(
            ControlMessage::BridgeCoordination(coordination),
            MessagePriority::Normal,
        );
    }

    // ----- offline queue ---------------------------------------------------

    fn emit_queue_events(&mut self) {
        let len = self.queue.len();
        for state in self.queue.take_events() {
            tracing::info!(node = %self.id, ?state, len, "offline queue state");
            self.delegate.on_queue_state(state, len);
        }
        #[cfg(feature = "metrics")]
        metrics::set_queue_size(len);
    }

    fn drain_queue(&mut self, now: Timestamp) {
        if self.queue.is_empty() {
            return;
        }
        let Some(target) = self.bridges.select_bridge(now) else {
            tracing::trace!(node = %self.id, queued = self.queue.len(), "no bridge for queued messages");
            return;
        };

        let report = if target == self.id {
            if self.role != Role::Bridge || !self.internet_connected {
                return;
            }
            let delegate = &self.delegate;
            self.queue.flush_with(|msg| delegate.on_uplink(msg))
        } else {
            let Some(conn) = self.link_for(target) else {
                tracing::debug!(node = %self.id, bridge = %target, "no route to bridge");
                return;
            };
            let id = self.id;
            let connections = &mut self.connections;
            self.queue.flush_with(|msg| {
                let body = ControlMessage::UplinkData(UplinkData {
                    id: msg.id,
                    priority: msg.priority,
                    destination: msg.destination.clone(),
                    payload: msg.payload.clone(),
                })
                .encode();
                let frame = Frame::single(MessageType::UPLINK_DATA, id, target, body)
                    .with_priority(msg.priority);
                connections.get_mut(conn).is_some_and(|c| c.enqueue(frame))
            })
        };

        if report.sent > 0 || report.dropped > 0 {
            tracing::debug!(
                node = %self.id,
                bridge = %target,
                sent = report.sent,
                retained = report.retained,
                dropped = report.dropped,
                "drained offline queue"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::record_queue_sent(report.sent);
            metrics::record_queue_dropped(report.dropped);
        }
        self.emit_queue_events();
    }

    fn on_uplink_data(&mut self, now: Timestamp, data: UplinkData) {
        if self.role == Role::Bridge && self.internet_connected {
            let msg = QueuedMessage {
                id: data.id,
                priority: data.priority,
                payload: data.payload,
                destination: data.destination,
                created_at: now,
                attempts: 0,
            };
            if self.delegate.on_uplink(&msg) {
                return;
            }
            if let Err(err) = self.enqueue_uplink(now, msg.payload, msg.destination, msg.priority) {
                tracing::warn!(node = %self.id, error = %err, "could not hold uplink message");
            }
            return;
        }
        tracing::debug!(node = %self.id, "uplink message arrived at a non-bridge, queueing");
        if let Err(err) = self.enqueue_uplink(now, data.payload, data.destination, data.priority) {
            tracing::warn!(node = %self.id, error = %err, "could not hold uplink message");
        }
    }
}

impl<D: MeshDelegate> std::fmt::Debug for Mesh<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("connections", &self.connections)
            .field("known_nodes", &self.topology.current_tree().size())
            .field("election", &self.election.state())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UplinkCredentials;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(NodeId, Bytes)>>,
        new_connections: Mutex<Vec<NodeId>>,
        roles: Mutex<Vec<bool>>,
        queue_states: Mutex<Vec<QueueState>>,
        uplinked: Mutex<Vec<u32>>,
        accept_uplink: bool,
    }

    impl MeshDelegate for Recorder {
        fn on_receive(&self, from: NodeId, _msg_type: u16, body: &Bytes) {
            self.received.lock().push((from, body.clone()));
        }
        fn on_new_connection(&self, node: NodeId) {
            self.new_connections.lock().push(node);
        }
        fn on_role_changed(&self, is_bridge: bool, _reason: &str) {
            self.roles.lock().push(is_bridge);
        }
        fn on_queue_state(&self, state: QueueState, _len: usize) {
            self.queue_states.lock().push(state);
        }
        fn on_uplink(&self, msg: &QueuedMessage) -> bool {
            self.uplinked.lock().push(msg.id);
            self.accept_uplink
        }
    }

    fn config() -> MeshConfig {
        MeshConfig::fast_failover()
            .with_mesh("test", "pw")
            .with_rng_seed(7)
    }

    fn node(id: u32, recorder: &Arc<Recorder>) -> Mesh<Arc<Recorder>> {
        Mesh::new(NodeId::new(id), config(), recorder.clone()).unwrap()
    }

    /// Move every queued frame across the single link until both sides
    /// are quiet.
    fn pump(
        a: &mut Mesh<Arc<Recorder>>,
        a_conn: ConnectionId,
        b: &mut Mesh<Arc<Recorder>>,
        b_conn: ConnectionId,
        now: Timestamp,
    ) {
        for _ in 0..16 {
            let from_a = a.poll_transmit(64);
            let from_b = b.poll_transmit(64);
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (_, frame) in from_a {
                b.handle_bytes(now, b_conn, &frame.encode_to_bytes()).unwrap();
            }
            for (_, frame) in from_b {
                a.handle_frame(now, a_conn, frame).unwrap();
            }
        }
    }

    fn linked() -> (
        Mesh<Arc<Recorder>>,
        ConnectionId,
        Mesh<Arc<Recorder>>,
        ConnectionId,
        Arc<Recorder>,
    ) {
        let rec = Arc::new(Recorder::default());
        let mut child = node(2, &rec);
        let mut parent = node(1, &rec);
        let now = Timestamp::ZERO;
        let c_conn = child.on_connected(now, Direction::Station, Some(NodeId::new(1)));
        let p_conn = parent.on_connected(now, Direction::AccessPoint, None);
        pump(&mut child, c_conn, &mut parent, p_conn, now);
        (child, c_conn, parent, p_conn, rec)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let (child, c_conn, parent, p_conn, rec) = linked();
        assert!(child.connections().get(c_conn).unwrap().is_established());
        assert!(parent.connections().get(p_conn).unwrap().is_established());
        assert_eq!(child.route(NodeId::new(1)).unwrap().hop_count, 1);
        assert_eq!(parent.route(NodeId::new(2)).unwrap().hop_count, 1);
        assert_eq!(rec.new_connections.lock().len(), 2);
    }

    #[test]
    fn test_frames_before_handshake_are_dropped() {
        let rec = Arc::new(Recorder::default());
        let mut mesh = node(1, &rec);
        let conn = mesh.on_connected(Timestamp::ZERO, Direction::AccessPoint, None);
        let frame = Frame::broadcast(MessageType::BROADCAST, NodeId::new(9), Bytes::from_static(b"hi"));
        mesh.handle_frame(Timestamp::ZERO, conn, frame).unwrap();
        assert!(rec.received.lock().is_empty());
    }

    #[test]
    fn test_unknown_connection_is_an_error() {
        let rec = Arc::new(Recorder::default());
        let mut mesh = node(1, &rec);
        let frame = Frame::broadcast(MessageType::BROADCAST, NodeId::new(9), Bytes::new());
        let bogus = ConnectionId::from_parts(5, 0);
        assert!(matches!(
            mesh.handle_frame(Timestamp::ZERO, bogus, frame),
            Err(Error::UnknownConnection(_))
        ));
        assert!(mesh.handle_bytes(Timestamp::ZERO, bogus, &[1, 2]).is_err());
    }

    #[test]
    fn test_single_message_delivery() {
        let (mut child, c_conn, mut parent, p_conn, rec) = linked();
        assert!(child.send_single(NodeId::new(1), Bytes::from_static(b"ping")));
        assert!(!child.send_single(NodeId::new(77), Bytes::from_static(b"lost")));
        pump(&mut child, c_conn, &mut parent, p_conn, Timestamp::ZERO);
        let received = rec.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], (NodeId::new(2), Bytes::from_static(b"ping")));
    }

    #[test]
    fn test_registered_handler_takes_precedence() {
        let (mut child, c_conn, mut parent, p_conn, rec) = linked();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        parent
            .register_handler(40, move |_| *counter.lock() += 1)
            .unwrap();
        assert!(parent.register_handler(40, |_| {}).is_err());
        assert!(matches!(
            child.send_typed(5, None, Bytes::new(), MessagePriority::Normal),
            Err(Error::ReservedType(5))
        ));
        child
            .send_typed(40, Some(NodeId::new(1)), Bytes::new(), MessagePriority::High)
            .unwrap();
        pump(&mut child, c_conn, &mut parent, p_conn, Timestamp::ZERO);
        assert_eq!(*hits.lock(), 1);
        assert!(rec.received.lock().is_empty());
    }

    #[test]
    fn test_disconnect_prunes_routes() {
        let (mut child, c_conn, _parent, _p_conn, _rec) = linked();
        child.on_disconnected(Timestamp::from_secs(1), c_conn);
        assert!(child.route(NodeId::new(1)).is_none());
        assert!(child.connections().is_empty());
        assert!(child.poll_action().is_none());
    }

    #[test]
    fn test_handshake_timeout_closes_link() {
        let rec = Arc::new(Recorder::default());
        let mut mesh = node(1, &rec);
        mesh.on_connected(Timestamp::ZERO, Direction::Station, Some(NodeId::new(5)));
        mesh.tick(Timestamp::ZERO);
        while mesh.poll_action().is_some() {}
        mesh.tick(Timestamp::from_secs(4));
        assert!(mesh.connections().is_empty());
        let mut saw_disconnect = false;
        while let Some(action) = mesh.poll_action() {
            saw_disconnect |= matches!(action, LifecycleAction::Disconnect { .. });
        }
        assert!(saw_disconnect);
    }

    #[test]
    fn test_time_sync_tie_goes_to_higher_id() {
        // Two unrooted single-node sides: node 1 adopts node 2's clock.
        let (mut child, c_conn, mut parent, p_conn, _rec) = linked();
        child.clock.apply(5_000_000);
        let now = Timestamp::from_secs(1);
        child.tick(now);
        parent.tick(now);
        pump(&mut child, c_conn, &mut parent, p_conn, now);
        let diff = child.mesh_time(now) as i64 - parent.mesh_time(now) as i64;
        assert!(diff.abs() < 1_000, "clocks differ by {diff}us");
        assert_eq!(parent.clock().offset(), 5_000_000);
        assert_eq!(child.clock().samples(), 1);
    }

    #[test]
    fn test_configured_bridge_promotes_on_next_turn() {
        let rec = Arc::new(Recorder::default());
        let cfg = config().with_uplink(UplinkCredentials::new("router", "secret"));
        let mut mesh = Mesh::new(NodeId::new(1), cfg, rec.clone()).unwrap();
        mesh.init_as_bridge().unwrap();
        assert_eq!(mesh.role(), Role::Node);

        mesh.tick(Timestamp::ZERO);
        assert_eq!(mesh.role(), Role::Promoting);
        let mut uplink_requested = false;
        while let Some(action) = mesh.poll_action() {
            uplink_requested |= action == LifecycleAction::StartUplink;
        }
        assert!(uplink_requested);

        mesh.on_uplink_status(Timestamp::ZERO, true);
        assert!(mesh.is_bridge());
        assert!(mesh.tree().is_rooted());
        assert_eq!(*rec.roles.lock(), vec![true]);
        assert_eq!(
            mesh.bridges().primary_bridge(Timestamp::ZERO).map(|b| b.node_id),
            Some(NodeId::new(1))
        );
    }

    #[test]
    fn test_failed_uplink_reverts_next_turn() {
        let rec = Arc::new(Recorder::default());
        let cfg = config().with_uplink(UplinkCredentials::new("router", "secret"));
        let mut mesh = Mesh::new(NodeId::new(1), cfg, rec.clone()).unwrap();
        mesh.init_as_bridge().unwrap();
        mesh.tick(Timestamp::ZERO);
        mesh.on_uplink_status(Timestamp::ZERO, false);
        assert_eq!(mesh.role(), Role::Promoting);
        mesh.tick(Timestamp::from_millis(10));
        assert_eq!(mesh.role(), Role::Node);
        assert!(!mesh.tree().is_rooted());
        assert_eq!(*rec.roles.lock(), vec![false]);
    }

    #[test]
    fn test_silent_uplink_driver_reverts_after_timeout() {
        let rec = Arc::new(Recorder::default());
        let mut election = config().election;
        election.uplink_timeout = Duration::from_secs(5);
        let cfg = config()
            .with_uplink(UplinkCredentials::new("router", "secret"))
            .with_election(election);
        let mut mesh = Mesh::new(NodeId::new(1), cfg, rec.clone()).unwrap();
        mesh.init_as_bridge().unwrap();
        mesh.tick(Timestamp::ZERO);
        assert_eq!(mesh.role(), Role::Promoting);

        // The driver never answers StartUplink.
        let mut now = Timestamp::ZERO;
        while now < Timestamp::from_millis(4_900) {
            now += Duration::from_millis(100);
            mesh.tick(now);
        }
        assert_eq!(mesh.role(), Role::Promoting);
        for _ in 0..3 {
            now += Duration::from_millis(100);
            mesh.tick(now);
        }
        assert_eq!(mesh.role(), Role::Node);
        assert!(!mesh.tree().is_rooted());
        assert_eq!(*rec.roles.lock(), vec![false]);

        // A late report no longer changes anything.
        mesh.on_uplink_status(now, true);
        assert_eq!(mesh.role(), Role::Node);
    }

    #[test]
    fn test_bridge_without_credentials_is_rejected() {
        let rec = Arc::new(Recorder::default());
        let mut mesh = node(1, &rec);
        assert!(matches!(mesh.init_as_bridge(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bridge_drains_queue_to_uplink() {
        let rec = Arc::new(Recorder {
            accept_uplink: true,
            ..Default::default()
        });
        let cfg = config().with_uplink(UplinkCredentials::new("router", "secret"));
        let mut mesh = Mesh::new(NodeId::new(1), cfg, rec.clone()).unwrap();
        let id = mesh
            .enqueue_uplink(Timestamp::ZERO, &b"reading"[..], "sensors", MessagePriority::High)
            .unwrap();
        assert_eq!(*rec.queue_states.lock(), vec![QueueState::Normal]);

        mesh.init_as_bridge().unwrap();
        mesh.tick(Timestamp::ZERO);
        mesh.on_uplink_status(Timestamp::ZERO, true);
        mesh.tick(Timestamp::from_secs(1));

        assert_eq!(*rec.uplinked.lock(), vec![id]);
        assert!(mesh.queue().is_empty());
        assert_eq!(rec.queue_states.lock().last(), Some(&QueueState::Empty));
    }

    #[test]
    fn test_uplink_data_travels_to_bridge() {
        let rec = Arc::new(Recorder {
            accept_uplink: true,
            ..Default::default()
        });
        let cfg = config().with_uplink(UplinkCredentials::new("router", "secret"));
        let mut bridge = Mesh::new(NodeId::new(1), cfg, rec.clone()).unwrap();
        let mut child = node(2, &rec);
        let now = Timestamp::ZERO;

        bridge.init_as_bridge().unwrap();
        bridge.tick(now);
        bridge.on_uplink_status(now, true);
        while bridge.poll_action().is_some() {}

        let c_conn = child.on_connected(now, Direction::Station, Some(NodeId::new(1)));
        let b_conn = bridge.on_connected(now, Direction::AccessPoint, None);
        pump(&mut child, c_conn, &mut bridge, b_conn, now);

        let later = Timestamp::from_secs(1);
        bridge.tick(later);
        pump(&mut child, c_conn, &mut bridge, b_conn, later);
        assert!(child.bridges().has_primary(later));

        let id = child
            .enqueue_uplink(later, &b"alarm"[..], "alerts", MessagePriority::Critical)
            .unwrap();
        child.tick(later);
        pump(&mut child, c_conn, &mut bridge, b_conn, later);

        assert!(child.queue().is_empty());
        assert_eq!(*rec.uplinked.lock(), vec![id]);
    }

    #[test]
    fn test_health_reflects_isolation() {
        let rec = Arc::new(Recorder::default());
        let mesh = node(1, &rec);
        let health = mesh.health(Timestamp::ZERO);
        assert!(health.status.is_unhealthy());
        assert_eq!(health.connectivity.known_nodes, 1);
    }
}
