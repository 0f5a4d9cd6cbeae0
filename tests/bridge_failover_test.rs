//! Bridge tracking, election and takeover across simulated nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    all_see_primary, bridge_capable_config, fast_config, ids, sim_with, EventLog, CONVERGE_LIMIT,
};
use treemesh::testing::SimNetwork;
use treemesh::{
    BridgeEvent, ElectionOutcome, Mesh, MeshConfig, NodeId, Role, Timestamp, WEAK_SIGNAL_REASON,
};

/// Router signal each candidate reports.
const ROUTER_RSSI: [(u32, i8); 4] = [(2, -70), (3, -45), (4, -60), (5, -65)];

fn failover_config() -> MeshConfig {
    let config = bridge_capable_config();
    // Keep the nodes from electing anyone while the tree is still forming.
    let election = config
        .election
        .clone()
        .with_startup_delay(Duration::from_secs(30));
    config.with_election(election)
}

/// Node 1 bridges and hangs off node 2; nodes 2 to 5 hear each other.
fn bridged_mesh(seed: u64) -> SimNetwork<Arc<EventLog>> {
    let mut sim = sim_with(seed, &[1, 2, 3, 4, 5], &failover_config());
    sim.set_in_range(NodeId::new(1), NodeId::new(2), -30);
    let rest = ids(&[2, 3, 4, 5]);
    for (i, a) in rest.iter().enumerate() {
        for b in &rest[i + 1..] {
            sim.set_in_range(*a, *b, -55);
        }
    }
    for (id, rssi) in ROUTER_RSSI {
        sim.node_mut(NodeId::new(id)).unwrap().set_router_rssi(rssi);
    }
    let bridge = sim.node_mut(NodeId::new(1)).unwrap();
    bridge.set_router_rssi(-50);
    bridge.init_as_bridge().unwrap();
    sim
}

#[test]
fn test_configured_bridge_is_everyones_primary() {
    let mut sim = bridged_mesh(21);
    let one = NodeId::new(1);

    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()
        && all_see_primary(s, one)));
    assert_eq!(sim.bridges(), vec![one]);
    assert_eq!(sim.node(one).unwrap().role(), Role::Bridge);

    let changes = sim.node(one).unwrap().delegate().role_changes.lock().clone();
    assert_eq!(changes, vec![(true, "configured as bridge".to_string())]);

    let events = sim
        .node(NodeId::new(4))
        .unwrap()
        .delegate()
        .bridge_events
        .lock()
        .clone();
    assert!(events.contains(&BridgeEvent::Available {
        node: one,
        internet: true
    }));
}

#[test]
fn test_lost_bridge_is_replaced_by_best_signal() {
    let mut sim = bridged_mesh(22);
    let (one, three) = (NodeId::new(1), NodeId::new(3));
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()
        && all_see_primary(s, one)));
    // Let the startup hold-off expire so the survivors may elect.
    let elapsed = sim.now().saturating_duration_since(Timestamp::ZERO);
    sim.run_for(Duration::from_secs(31).saturating_sub(elapsed));
    assert_eq!(sim.bridges(), vec![one]);

    sim.remove_node(one);

    // Status timeout, grace period, jitter and one collection window.
    assert!(sim.run_until(Duration::from_secs(10), |s| !s.bridges().is_empty()));
    assert_eq!(sim.bridges(), vec![three]);

    assert!(sim.run_until(Duration::from_secs(30), |s| s.is_converged()
        && all_see_primary(s, three)));
    assert_eq!(sim.bridges(), vec![three]);

    // Node 2 lost its only link with the old bridge and may still be
    // rejoining while the others vote. It then learns the winner from the
    // takeover announcement.
    for id in [2, 4, 5] {
        let node = sim.node(NodeId::new(id)).unwrap();
        assert_eq!(node.role(), Role::Node);
        let last = node.election().history().last().cloned().expect("a round was recorded");
        assert_eq!(last.winner, Some(three), "node {id}");
        assert!(
            matches!(last.outcome, ElectionOutcome::Lost | ElectionOutcome::Observed),
            "node {id}: {:?}",
            last.outcome
        );
    }
    let changes = sim.node(three).unwrap().delegate().role_changes.lock().clone();
    assert_eq!(changes, vec![(true, "won bridge election".to_string())]);
}

#[test]
fn test_without_credentials_no_one_takes_over() {
    let config = common::fast_config();
    let mut sim = sim_with(24, &[1, 2, 3], &config);
    sim.connect_all(-50);
    for id in [1, 2, 3] {
        sim.node_mut(NodeId::new(id)).unwrap().set_router_rssi(-40);
    }
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(20));
    assert!(sim.bridges().is_empty());
    for id in [1, 2, 3] {
        assert!(sim.node(NodeId::new(id)).unwrap().election().history().next().is_none());
    }
}

#[test]
fn test_weak_lone_candidate_stays_node_and_says_why() {
    let (one, two) = (NodeId::new(1), NodeId::new(2));
    let mut sim = SimNetwork::new(25);
    sim.add_node(Mesh::new(one, bridge_capable_config(), EventLog::new()).unwrap());
    sim.add_node(Mesh::new(two, fast_config(), EventLog::new()).unwrap());
    sim.set_in_range(one, two, -50);
    // Below the default -80 dBm floor.
    sim.node_mut(one).unwrap().set_router_rssi(-90);

    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(10));

    assert!(sim.bridges().is_empty());
    let node = sim.node(one).unwrap();
    assert_eq!(node.role(), Role::Node);
    assert!(node
        .election()
        .history()
        .any(|r| r.outcome == ElectionOutcome::Rejected && r.winner.is_none()));
    let changes = node.delegate().role_changes.lock().clone();
    assert!(changes.contains(&(false, WEAK_SIGNAL_REASON.to_string())));
    assert!(changes.iter().all(|(is_bridge, _)| !is_bridge));
}
