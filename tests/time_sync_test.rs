//! Mesh clock agreement between nodes with skewed local clocks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, ids, mesh_time, sim_with, EventLog, CONVERGE_LIMIT};
use treemesh::testing::SimNetwork;
use treemesh::NodeId;

const SKEWS_MS: [(u32, u64); 4] = [(1, 0), (2, 3_000), (3, 7_250), (4, 1_500)];

type Sim = SimNetwork<Arc<EventLog>>;

/// Largest disagreement between any two mesh clocks, microseconds.
fn spread(sim: &Sim) -> u64 {
    let times: Vec<u64> = sim.node_ids().into_iter().map(|id| mesh_time(sim, id)).collect();
    let max = times.iter().copied().max().unwrap_or(0);
    let min = times.iter().copied().min().unwrap_or(0);
    max - min
}

fn skewed_chain(seed: u64, smoothing: f64) -> Sim {
    let config = fast_config().with_time_smoothing(smoothing);
    let mut sim = sim_with(seed, &[1, 2, 3, 4], &config);
    sim.chain(&ids(&[1, 2, 3, 4]), -50);
    for (id, skew) in SKEWS_MS {
        sim.set_clock_skew(NodeId::new(id), Duration::from_millis(skew));
    }
    sim
}

#[test]
fn test_clocks_agree_after_convergence() {
    let mut sim = skewed_chain(11, 1.0);
    assert!(spread(&sim) >= 7_000_000);

    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(60));

    assert!(spread(&sim) <= 1_000, "spread {}us", spread(&sim));
}

#[test]
fn test_smoothed_clocks_still_agree() {
    let mut sim = skewed_chain(12, 0.5);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(120));

    assert!(spread(&sim) <= 10_000, "spread {}us", spread(&sim));
}

#[test]
fn test_adjustments_are_reported() {
    let mut sim = skewed_chain(13, 1.0);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(15));

    let adjusted = sim
        .node_ids()
        .into_iter()
        .filter(|id| {
            !sim.node(*id)
                .unwrap()
                .delegate()
                .time_adjustments
                .lock()
                .is_empty()
        })
        .count();
    // At least every node but the one whose clock everybody follows.
    assert!(adjusted >= 3, "only {adjusted} nodes adjusted");
}

#[test]
fn test_mesh_time_moves_forward() {
    let mut sim = skewed_chain(14, 1.0);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged()));
    sim.run_for(Duration::from_secs(20));

    let before = mesh_time(&sim, NodeId::new(3));
    sim.run_for(Duration::from_secs(1));
    let after = mesh_time(&sim, NodeId::new(3));
    let advanced = after.saturating_sub(before);
    assert!((900_000..=1_100_000).contains(&advanced), "advanced {advanced}us");
}
