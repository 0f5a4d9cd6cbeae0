//! Shortest-path routing over a tree snapshot.
//!
//! Routes are derived from a [`TreeSnapshot`] with a breadth-first search
//! and never stored across topology changes. Since the snapshot is topped
//! by the local node, the first hop toward any destination is the
//! neighbour whose subtree contains it.

use std::collections::{HashMap, VecDeque};

use crate::topology::{NodeTree, TreeSnapshot};
use crate::types::NodeId;

/// Next hop and distance to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Neighbour to hand the frame to. Equal to the local node for self.
    pub next_hop: NodeId,
    /// Links between the local node and the destination.
    pub hop_count: u32,
}

/// Routing table computed from one snapshot.
#[derive(Debug, Clone)]
pub struct Router {
    local: NodeId,
    version: u64,
    routes: HashMap<NodeId, Route>,
    parents: HashMap<NodeId, NodeId>,
}

impl Router {
    /// Compute routes for every node in `snapshot`.
    ///
    /// Runs in `O(nodes + edges)`.
    pub fn new(snapshot: &TreeSnapshot) -> Self {
        let local = snapshot.local();
        let adjacency = adjacency(snapshot.tree());

        let mut routes = HashMap::with_capacity(adjacency.len());
        let mut parents = HashMap::with_capacity(adjacency.len());
        let mut queue = VecDeque::new();

        routes.insert(
            local,
            Route {
                next_hop: local,
                hop_count: 0,
            },
        );
        queue.push_back(local);

        while let Some(node) = queue.pop_front() {
            let Some(here) = routes.get(&node).copied() else {
                continue;
            };
            for &next in adjacency.get(&node).into_iter().flatten() {
                if routes.contains_key(&next) {
                    continue;
                }
                let next_hop = if node == local { next } else { here.next_hop };
                routes.insert(
                    next,
                    Route {
                        next_hop,
                        hop_count: here.hop_count + 1,
                    },
                );
                parents.insert(next, node);
                queue.push_back(next);
            }
        }

        Self {
            local,
            version: snapshot.version(),
            routes,
            parents,
        }
    }

    /// Version of the snapshot this table was computed from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Route to `dest`, or `None` when it is unreachable.
    pub fn route(&self, dest: NodeId) -> Option<Route> {
        self.routes.get(&dest).copied()
    }

    /// Hop count to `dest`, or `None` when it is unreachable.
    pub fn hop_count(&self, dest: NodeId) -> Option<u32> {
        self.routes.get(&dest).map(|r| r.hop_count)
    }

    /// Neighbour to forward to for `dest`.
    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        if dest == self.local {
            return None;
        }
        self.routes.get(&dest).map(|r| r.next_hop)
    }

    /// Nodes from the local node to `dest`, both ends included.
    pub fn path(&self, dest: NodeId) -> Option<Vec<NodeId>> {
        if !self.routes.contains_key(&dest) {
            return None;
        }
        let mut path = vec![dest];
        let mut cur = dest;
        while cur != self.local {
            cur = *self.parents.get(&cur)?;
            path.push(cur);
        }
        path.reverse();
        Some(path)
    }

    /// Every reachable destination except the local node.
    pub fn routing_table(&self) -> Vec<(NodeId, Route)> {
        let mut table: Vec<_> = self
            .routes
            .iter()
            .filter(|(id, _)| **id != self.local)
            .map(|(id, r)| (*id, *r))
            .collect();
        table.sort_by_key(|(id, r)| (r.hop_count, *id));
        table
    }

    /// Number of reachable nodes, including the local one.
    pub fn reachable(&self) -> usize {
        self.routes.len()
    }
}

fn adjacency(tree: &NodeTree) -> HashMap<NodeId, Vec<NodeId>> {
    let mut adj: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        adj.entry(node.node_id).or_default();
        for sub in &node.subs {
            adj.entry(node.node_id).or_default().push(sub.node_id);
            adj.entry(sub.node_id).or_default().push(node.node_id);
            stack.push(sub);
        }
    }
    adj
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    // 1 ─┬─ 2 ── 3 ── 4
    //    └─ 5 ── 6
    fn sample() -> TreeSnapshot {
        TreeSnapshot::new(
            NodeTree::leaf(n(1))
                .with_sub(
                    NodeTree::leaf(n(2))
                        .with_sub(NodeTree::leaf(n(3)).with_sub(NodeTree::leaf(n(4)))),
                )
                .with_sub(NodeTree::leaf(n(5)).with_sub(NodeTree::leaf(n(6)))),
        )
    }

    #[test]
    fn test_self_and_neighbours() {
        let router = Router::new(&sample());
        assert_eq!(router.hop_count(n(1)), Some(0));
        assert_eq!(router.hop_count(n(2)), Some(1));
        assert_eq!(router.hop_count(n(5)), Some(1));
        assert_eq!(router.next_hop(n(1)), None);
    }

    #[test]
    fn test_descendants() {
        let router = Router::new(&sample());
        assert_eq!(
            router.route(n(4)),
            Some(Route {
                next_hop: n(2),
                hop_count: 3
            })
        );
        assert_eq!(router.next_hop(n(6)), Some(n(5)));
        assert_eq!(router.path(n(4)), Some(vec![n(1), n(2), n(3), n(4)]));
        assert_eq!(router.path(n(1)), Some(vec![n(1)]));
    }

    #[test]
    fn test_unreachable_is_none() {
        let router = Router::new(&sample());
        assert_eq!(router.route(n(99)), None);
        assert_eq!(router.hop_count(n(99)), None);
        assert_eq!(router.path(n(99)), None);
    }

    #[test]
    fn test_hop_count_matches_path_length() {
        let snapshot = sample();
        let router = Router::new(&snapshot);
        for id in snapshot.node_ids() {
            let path = router.path(id).unwrap();
            assert_eq!(path.len() as u32 - 1, router.hop_count(id).unwrap());
            assert_eq!(path[0], n(1));
            if path.len() > 1 {
                assert_eq!(router.next_hop(id), Some(path[1]));
            }
        }
    }

    #[test]
    fn test_routing_table_sorted() {
        let router = Router::new(&sample());
        let table = router.routing_table();
        assert_eq!(table.len(), 5);
        assert!(table.windows(2).all(|w| w[0].1.hop_count <= w[1].1.hop_count));
        assert_eq!(router.reachable(), 6);
    }
}
