//! Spanning tree bookkeeping.
//!
//! Each established connection reports the subtree reachable through it
//! (the neighbour's whole view, minus us). The [`TopologyManager`] keeps
//! the latest report per connection and assembles them into a
//! [`TreeSnapshot`] rooted at this node. Snapshots are immutable and cheap
//! to clone; readers such as the router never observe a half-merged tree.
//!
//! Reports travel up and down the tree on every change, so views converge
//! without a consensus round: merging is a per-link replace, which makes it
//! idempotent.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{ConnectionId, NodeId};

/// Deepest tree accepted from the wire.
pub const MAX_TREE_DEPTH: usize = 64;

/// Largest tree accepted from the wire.
pub const MAX_TREE_NODES: usize = 1024;

/// A node and the subtrees hanging below it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeTree {
    /// The node at the top of this subtree.
    pub node_id: NodeId,
    /// Whether this node is the designated mesh root.
    pub root: bool,
    /// Child subtrees.
    pub subs: Vec<NodeTree>,
}

impl NodeTree {
    /// A single node without children.
    pub fn leaf(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: false,
            subs: Vec::new(),
        }
    }

    /// Builder helper adding a child.
    pub fn with_sub(mut self, sub: NodeTree) -> Self {
        self.subs.push(sub);
        self
    }

    /// Number of nodes in this subtree, including the top node.
    pub fn size(&self) -> usize {
        1 + self.subs.iter().map(NodeTree::size).sum::<usize>()
    }

    /// Whether `id` appears anywhere in this subtree.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node_id == id || self.subs.iter().any(|s| s.contains(id))
    }

    /// Whether any node in this subtree is the mesh root.
    pub fn is_rooted(&self) -> bool {
        self.root || self.subs.iter().any(NodeTree::is_rooted)
    }

    /// All node ids in depth-first order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.size());
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.node_id);
        for sub in &self.subs {
            sub.collect_ids(out);
        }
    }

    /// Encode the subtree.
    ///
    /// Layout per node: `[id u32][root u8][child count u16][children...]`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.node_id.get());
        buf.put_u8(u8::from(self.root));
        buf.put_u16(self.subs.len() as u16);
        for sub in &self.subs {
            sub.encode(buf);
        }
    }

    /// Encode into a new buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size() * 7);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a subtree, rejecting trees deeper than [`MAX_TREE_DEPTH`]
    /// or larger than [`MAX_TREE_NODES`].
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let mut budget = MAX_TREE_NODES;
        Self::decode_inner(buf, 0, &mut budget)
    }

    fn decode_inner(buf: &mut impl Buf, depth: usize, budget: &mut usize) -> Option<Self> {
        if depth >= MAX_TREE_DEPTH || *budget == 0 || buf.remaining() < 7 {
            return None;
        }
        *budget -= 1;
        let node_id = NodeId::new(buf.get_u32());
        let root = match buf.get_u8() {
            0 => false,
            1 => true,
            _ => return None,
        };
        let count = buf.get_u16() as usize;
        if count > *budget {
            return None;
        }
        let mut subs = Vec::with_capacity(count);
        for _ in 0..count {
            subs.push(Self::decode_inner(buf, depth + 1, budget)?);
        }
        Some(Self {
            node_id,
            root,
            subs,
        })
    }

    /// Decode from a byte slice, requiring that all input is consumed.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let tree = Self::decode(&mut cursor)?;
        if cursor.has_remaining() {
            return None;
        }
        Some(tree)
    }

    /// Whether a node id appears more than once.
    pub fn has_duplicates(&self) -> bool {
        let mut seen = HashSet::new();
        !self.node_ids().into_iter().all(|id| seen.insert(id))
    }
}

/// Immutable view of the tree as seen from this node.
///
/// The top node is always the local node; its children are the subtrees
/// reported by established neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    tree: Arc<NodeTree>,
    version: u64,
}

impl TreeSnapshot {
    /// Wrap a tree. Mostly useful for routing tests.
    pub fn new(tree: NodeTree) -> Self {
        Self {
            tree: Arc::new(tree),
            version: 0,
        }
    }

    /// The tree, topped by the local node.
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// The local node.
    pub fn local(&self) -> NodeId {
        self.tree.node_id
    }

    /// Change counter of the manager that produced this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of known nodes, including the local one.
    pub fn size(&self) -> usize {
        self.tree.size()
    }

    /// Whether `id` is part of the tree.
    pub fn contains(&self, id: NodeId) -> bool {
        self.tree.contains(id)
    }

    /// Whether the tree contains the mesh root.
    pub fn is_rooted(&self) -> bool {
        self.tree.is_rooted()
    }

    /// All known node ids.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.tree.node_ids()
    }
}

/// Outcome of merging a neighbour's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The report matched what we already had.
    Unchanged,
    /// The view changed; reports must be propagated to other neighbours.
    Updated,
    /// The report would create a cycle. The link should be dropped.
    Loop {
        /// A node that would be reachable twice.
        node: NodeId,
    },
    /// The report's top node is not the peer of this connection.
    PeerMismatch {
        /// Peer recorded for the connection.
        expected: NodeId,
        /// Node id found at the top of the report.
        got: NodeId,
    },
}

#[derive(Debug, Clone)]
struct Link {
    peer: NodeId,
    subtree: NodeTree,
}

/// Owner of the local spanning tree view.
#[derive(Debug)]
pub struct TopologyManager {
    local: NodeId,
    is_root: bool,
    links: BTreeMap<ConnectionId, Link>,
    snapshot: TreeSnapshot,
    version: u64,
}

impl TopologyManager {
    /// Create an empty view for `local`.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            is_root: false,
            links: BTreeMap::new(),
            snapshot: TreeSnapshot::new(NodeTree::leaf(local)),
            version: 0,
        }
    }

    /// The local node id.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Mark this node as the designated root.
    pub fn set_root(&mut self, root: bool) {
        if self.is_root != root {
            self.is_root = root;
            self.rebuild();
        }
    }

    /// Whether this node is the designated root.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Register a freshly handshaken link with the peer as a leaf.
    ///
    /// Fails with [`MergeOutcome::Loop`] when the peer is already known
    /// through another link.
    pub fn add_link(&mut self, conn: ConnectionId, peer: NodeId) -> MergeOutcome {
        self.merge_subtree(conn, NodeTree::leaf(peer), Some(peer))
    }

    /// Replace the subtree reported through `conn`.
    ///
    /// Merging the same report twice leaves the view unchanged.
    pub fn merge_subtree(
        &mut self,
        conn: ConnectionId,
        report: NodeTree,
        expected_peer: Option<NodeId>,
    ) -> MergeOutcome {
        let expected = expected_peer.or_else(|| self.links.get(&conn).map(|l| l.peer));
        if let Some(expected) = expected {
            if expected != report.node_id {
                return MergeOutcome::PeerMismatch {
                    expected,
                    got: report.node_id,
                };
            }
        }

        if report.contains(self.local) {
            return MergeOutcome::Loop { node: self.local };
        }
        if report.has_duplicates() {
            return MergeOutcome::Loop {
                node: report.node_id,
            };
        }
        for (other, link) in &self.links {
            if *other == conn {
                continue;
            }
            if let Some(dup) = report.node_ids().into_iter().find(|id| link.subtree.contains(*id)) {
                return MergeOutcome::Loop { node: dup };
            }
        }

        if let Some(existing) = self.links.get(&conn) {
            if existing.subtree == report {
                return MergeOutcome::Unchanged;
            }
        }

        tracing::trace!(
            local = %self.local,
            conn = %conn,
            peer = %report.node_id,
            size = report.size(),
            "merging subtree report"
        );
        self.links.insert(
            conn,
            Link {
                peer: report.node_id,
                subtree: report,
            },
        );
        self.rebuild();
        MergeOutcome::Updated
    }

    /// Forget the subtree behind `conn`, returning it.
    pub fn remove_link(&mut self, conn: ConnectionId) -> Option<NodeTree> {
        let link = self.links.remove(&conn)?;
        tracing::debug!(
            local = %self.local,
            peer = %link.peer,
            pruned = link.subtree.size(),
            "pruning subtree of closed connection"
        );
        self.rebuild();
        Some(link.subtree)
    }

    /// Current immutable view.
    pub fn current_tree(&self) -> TreeSnapshot {
        self.snapshot.clone()
    }

    /// The report to send through `conn`: our view without that link.
    pub fn report_for(&self, conn: ConnectionId) -> NodeTree {
        NodeTree {
            node_id: self.local,
            root: self.is_root,
            subs: self
                .links
                .iter()
                .filter(|(id, _)| **id != conn)
                .map(|(_, l)| l.subtree.clone())
                .collect(),
        }
    }

    /// Peer recorded for a connection.
    pub fn peer_of(&self, conn: ConnectionId) -> Option<NodeId> {
        self.links.get(&conn).map(|l| l.peer)
    }

    /// The connection whose direct peer is `node`.
    pub fn link_to(&self, node: NodeId) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, l)| l.peer == node)
            .map(|(id, _)| *id)
    }

    /// The connection behind which `node` lives.
    pub fn link_towards(&self, node: NodeId) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, l)| l.subtree.contains(node))
            .map(|(id, _)| *id)
    }

    /// Size of the subtree reported through `conn`, zero when unknown.
    pub fn subtree_size(&self, conn: ConnectionId) -> usize {
        self.links.get(&conn).map(|l| l.subtree.size()).unwrap_or(0)
    }

    /// Whether the subtree behind `conn` contains the root.
    pub fn subtree_rooted(&self, conn: ConnectionId) -> bool {
        self.links
            .get(&conn)
            .map(|l| l.subtree.is_rooted())
            .unwrap_or(false)
    }

    /// Number of linked neighbours.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Monotonic change counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn rebuild(&mut self) {
        self.version += 1;
        let tree = NodeTree {
            node_id: self.local,
            root: self.is_root,
            subs: self.links.values().map(|l| l.subtree.clone()).collect(),
        };
        self.snapshot = TreeSnapshot {
            tree: Arc::new(tree),
            version: self.version,
        };
    }
}
