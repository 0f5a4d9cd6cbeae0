//! Frame loss and latency.

use std::time::Duration;

use treemesh::testing::ChaosConfig;
use treemesh::NodeId;

use crate::common::{fast_config, ids, sim_with};

#[test]
fn test_converges_despite_frame_loss() {
    let mut sim = sim_with(51, &[1, 2, 3, 4, 5], &fast_config())
        .with_chaos(ChaosConfig::new().with_message_loss_rate(0.05));
    sim.connect_all(-50);

    assert!(sim.run_until(Duration::from_secs(120), |s| s.is_converged()));
    let stats = sim.stats();
    assert!(stats.messages_dropped > 0);
    assert!(stats.delivery_rate() < 1.0);

    // Once the air clears the mesh settles into a single tree.
    sim.set_chaos(ChaosConfig::new());
    assert!(sim.run_until(Duration::from_secs(60), |s| {
        s.is_converged() && s.link_count() == 4
    }));
    sim.run_for(Duration::from_secs(30));
    assert!(sim.is_converged());
    assert_eq!(sim.link_count(), 4);
}

#[test]
fn test_latency_does_not_prevent_convergence() {
    let mut sim = sim_with(52, &[1, 2, 3, 4], &fast_config())
        .with_chaos(ChaosConfig::new().with_latency(Duration::from_millis(40)));
    sim.chain(&ids(&[1, 2, 3, 4]), -50);

    assert!(sim.run_until(Duration::from_secs(90), |s| {
        s.is_converged() && s.link_count() == 3
    }));
    assert!(sim.stats().messages_delayed > 0);

    let (one, four) = (NodeId::new(1), NodeId::new(4));
    assert!(sim.node_mut(one).unwrap().send_single(four, "slow"));
    // Three hops of 40ms each, delivered on 10ms steps.
    assert!(sim.run_until(Duration::from_millis(500), |s| {
        !s.node(four).unwrap().delegate().received.lock().is_empty()
    }));
}

#[test]
fn test_total_loss_keeps_nodes_apart() {
    let mut sim = sim_with(53, &[1, 2], &fast_config())
        .with_chaos(ChaosConfig::new().with_message_loss_rate(1.0));
    sim.set_in_range(NodeId::new(1), NodeId::new(2), -40);

    sim.run_for(Duration::from_secs(30));
    assert!(!sim.is_converged());
    let stats = sim.stats();
    assert_eq!(stats.messages_dropped, stats.messages_total);
    assert!(stats.messages_total > 0);
}
