//! Partitions: links across the cut close, and the tree heals afterwards.

use std::time::Duration;

use treemesh::NodeId;

use crate::common::{fast_config, ids, sim_with, CONVERGE_LIMIT};

/// Node sync interval plus node timeout, with slack.
const DETECT_LIMIT: Duration = Duration::from_secs(15);

#[test]
fn test_partition_splits_and_heals() {
    let mut sim = sim_with(41, &[1, 2, 3], &fast_config());
    sim.chain(&ids(&[1, 2, 3]), -50);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged() && s.link_count() == 2));

    let (one, two, three) = (NodeId::new(1), NodeId::new(2), NodeId::new(3));
    sim.partition().partition(two, three);

    assert!(sim.run_until(DETECT_LIMIT, |s| {
        s.link_count() == 1
            && s.node(three).is_some_and(|n| n.tree().size() == 1)
            && s.node(one).is_some_and(|n| !n.tree().contains(three))
    }));
    assert!(sim.node(one).unwrap().route(three).is_none());
    assert!(sim.stats().messages_partitioned > 0);

    sim.partition().heal_all();
    assert!(sim.run_until(Duration::from_secs(30), |s| {
        s.is_converged() && s.link_count() == 2
    }));
    assert_eq!(
        sim.node(one).unwrap().route(three).map(|r| r.hop_count),
        Some(2)
    );
}

#[test]
fn test_isolated_node_leaves_and_returns() {
    let mut sim = sim_with(42, &[1, 2, 3, 4], &fast_config());
    sim.connect_all(-50);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged() && s.link_count() == 3));

    let four = NodeId::new(4);
    sim.partition().isolate(four, ids(&[1, 2, 3]));
    assert!(sim.run_until(DETECT_LIMIT + Duration::from_secs(10), |s| {
        s.node(four).is_some_and(|n| n.tree().size() == 1)
            && ids(&[1, 2, 3])
                .into_iter()
                .all(|id| s.node(id).is_some_and(|n| n.tree().size() == 3))
    }));

    sim.partition().heal_all();
    assert!(!sim.partition().is_active());
    assert!(sim.run_until(Duration::from_secs(30), |s| {
        s.is_converged() && s.link_count() == 3
    }));
}

#[test]
fn test_partition_between_halves_forms_two_trees() {
    let mut sim = sim_with(43, &[1, 2, 3, 4], &fast_config());
    sim.connect_all(-50);
    assert!(sim.run_until(CONVERGE_LIMIT, |s| s.is_converged() && s.link_count() == 3));

    for a in [1, 2] {
        for b in [3, 4] {
            sim.partition().partition(NodeId::new(a), NodeId::new(b));
        }
    }
    assert!(sim.run_until(DETECT_LIMIT + Duration::from_secs(10), |s| {
        s.link_count() == 2
            && s.node_ids()
                .into_iter()
                .all(|id| s.node(id).is_some_and(|n| n.tree().size() == 2))
    }));

    sim.partition().heal_all();
    assert!(sim.run_until(Duration::from_secs(30), |s| {
        s.is_converged() && s.link_count() == 3
    }));
}
