//! Shared helpers for the treemesh integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use treemesh::testing::SimNetwork;
use treemesh::{
    BridgeEvent, Mesh, MeshConfig, MeshDelegate, NodeId, QueueState, QueuedMessage,
    UplinkCredentials,
};

/// Install a tracing subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Everything a node reported through its delegate.
#[derive(Debug, Default)]
pub struct EventLog {
    pub received: Mutex<Vec<(NodeId, u16, Bytes)>>,
    pub bridge_events: Mutex<Vec<BridgeEvent>>,
    pub role_changes: Mutex<Vec<(bool, String)>>,
    pub queue_states: Mutex<Vec<QueueState>>,
    pub uplinked: Mutex<Vec<QueuedMessage>>,
    pub time_adjustments: Mutex<Vec<i64>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MeshDelegate for EventLog {
    fn on_receive(&self, from: NodeId, msg_type: u16, body: &Bytes) {
        self.received.lock().push((from, msg_type, body.clone()));
    }

    fn on_node_time_adjusted(&self, adjustment: i64) {
        self.time_adjustments.lock().push(adjustment);
    }

    fn on_bridge_changed(&self, event: &BridgeEvent) {
        self.bridge_events.lock().push(*event);
    }

    fn on_role_changed(&self, is_bridge: bool, reason: &str) {
        self.role_changes.lock().push((is_bridge, reason.to_string()));
    }

    fn on_queue_state(&self, state: QueueState, _len: usize) {
        self.queue_states.lock().push(state);
    }

    fn on_uplink(&self, msg: &QueuedMessage) -> bool {
        self.uplinked.lock().push(msg.clone());
        true
    }
}

pub type Node = Mesh<Arc<EventLog>>;

/// Fast timers, fixed seed, one mesh identity for every test.
pub fn fast_config() -> MeshConfig {
    MeshConfig::fast_failover()
        .with_mesh("testmesh", "secret")
        .with_rng_seed(42)
}

/// [`fast_config`] plus uplink credentials.
pub fn bridge_capable_config() -> MeshConfig {
    fast_config().with_uplink(UplinkCredentials::new("router", "routerpw"))
}

/// A simulator holding nodes `ids`, all built from `config`.
pub fn sim_with(seed: u64, ids: &[u32], config: &MeshConfig) -> SimNetwork<Arc<EventLog>> {
    init_tracing();
    let mut sim = SimNetwork::new(seed);
    for id in ids {
        let mesh = Mesh::new(NodeId::new(*id), config.clone(), EventLog::new())
            .expect("valid test config");
        sim.add_node(mesh);
    }
    sim
}

/// Node ids from plain numbers.
pub fn ids(raw: &[u32]) -> Vec<NodeId> {
    raw.iter().copied().map(NodeId::new).collect()
}

/// Whether every node names `bridge` as its primary bridge.
pub fn all_see_primary(sim: &SimNetwork<Arc<EventLog>>, bridge: NodeId) -> bool {
    sim.node_ids().into_iter().all(|id| {
        let now = sim.local_time(id);
        sim.node(id)
            .and_then(|n| n.bridges().primary_bridge(now).map(|b| b.node_id))
            == Some(bridge)
    })
}

/// Mesh time of `id` at the current virtual instant.
pub fn mesh_time(sim: &SimNetwork<Arc<EventLog>>, id: NodeId) -> u64 {
    let local = sim.local_time(id);
    sim.node(id).map_or(0, |n| n.mesh_time(local))
}

pub const CONVERGE_LIMIT: Duration = Duration::from_secs(90);
