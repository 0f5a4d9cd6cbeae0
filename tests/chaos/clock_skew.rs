//! Skewed local clocks on slow links.

use std::time::Duration;

use treemesh::testing::ChaosConfig;
use treemesh::NodeId;

use crate::common::{fast_config, ids, mesh_time, sim_with};

#[test]
fn test_symmetric_latency_does_not_bias_offsets() {
    let config = fast_config().with_time_smoothing(1.0);
    let mut sim = sim_with(61, &[1, 2, 3], &config)
        .with_chaos(ChaosConfig::new().with_latency(Duration::from_millis(20)));
    sim.chain(&ids(&[1, 2, 3]), -50);
    sim.set_clock_skew(NodeId::new(2), Duration::from_secs(4));
    sim.set_clock_skew(NodeId::new(3), Duration::from_millis(900));

    assert!(sim.run_until(Duration::from_secs(90), |s| {
        s.is_converged() && s.link_count() == 2
    }));
    sim.run_for(Duration::from_secs(40));

    let times: Vec<u64> = ids(&[1, 2, 3]).into_iter().map(|id| mesh_time(&sim, id)).collect();
    let max = times.iter().copied().max().unwrap_or(0);
    let min = times.iter().copied().min().unwrap_or(0);
    assert!(max - min <= 1_000, "mesh clocks differ by {}us", max - min);
}

#[test]
fn test_late_joiner_adopts_mesh_time() {
    let config = fast_config().with_time_smoothing(1.0);
    let mut sim = sim_with(62, &[1, 2, 3], &config);
    let (one, two, three) = (NodeId::new(1), NodeId::new(2), NodeId::new(3));
    sim.set_in_range(one, two, -45);
    sim.set_clock_skew(two, Duration::from_secs(2));
    sim.set_clock_skew(three, Duration::from_secs(30));
    assert!(sim.run_until(Duration::from_secs(60), |s| {
        s.node(one).is_some_and(|n| n.tree().size() == 2)
            && s.node(two).is_some_and(|n| n.tree().size() == 2)
    }));
    sim.run_for(Duration::from_secs(15));
    let settled = mesh_time(&sim, one);
    assert!(settled.abs_diff(mesh_time(&sim, two)) <= 1_000);

    // A lone node joins a tree of two and takes the tree's clock.
    sim.set_in_range(two, three, -50);
    assert!(sim.run_until(Duration::from_secs(60), |s| s.is_converged()));
    sim.run_for(Duration::from_secs(15));

    let tree_time = mesh_time(&sim, one);
    assert!(tree_time.abs_diff(mesh_time(&sim, three)) <= 1_000);
    assert!(tree_time.abs_diff(mesh_time(&sim, two)) <= 1_000);
    // The pair kept node 2's clock throughout; the joiner moved.
    let log = |id: NodeId| sim.node(id).unwrap().delegate().time_adjustments.lock().clone();
    assert!(log(two).is_empty());
    assert!(!log(three).is_empty());
}
