//! Links to neighbouring nodes.
//!
//! Connections live in a [`ConnectionTable`], a generational arena. Other
//! components only hold [`ConnectionId`] handles, so closing a link never
//! leaves a dangling reference behind: a stale handle simply stops
//! resolving.

use std::fmt;

use smallvec::SmallVec;

use crate::message::Frame;
use crate::priority::{MessagePriority, PriorityConfig, PriorityQueue};
use crate::time_sync::SyncSession;
use crate::types::{ConnectionId, NodeId, Timestamp};

/// State of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Transport connection is being opened.
    Connecting,
    /// Transport is up; waiting for the peer's first topology report.
    Handshaking,
    /// Topology exchanged, traffic flows both ways.
    Established,
    /// Being torn down; no more frames are accepted.
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::Handshaking => "handshaking",
            LinkState::Established => "established",
            LinkState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We connected to the peer's access point; the peer is our parent.
    Station,
    /// The peer connected to us; it is one of our children.
    AccessPoint,
}

/// One link to a neighbour.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    peer: Option<NodeId>,
    state: LinkState,
    outbound: PriorityQueue<Frame>,
    created_at: Timestamp,
    last_activity: Timestamp,
    next_node_sync: Timestamp,
    sync_deadline: Option<Timestamp>,
    pub(crate) time_sync: SyncSession,
}

impl Connection {
    fn new(id: ConnectionId, direction: Direction, peer: Option<NodeId>, now: Timestamp) -> Self {
        Self {
            id,
            direction,
            peer,
            state: LinkState::Connecting,
            outbound: PriorityQueue::new(PriorityConfig::default()),
            created_at: now,
            last_activity: now,
            next_node_sync: now,
            sync_deadline: None,
            time_sync: SyncSession::new(now),
        }
    }

    /// Handle of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Which side opened the link.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Peer id, known once the handshake completed (or, for station
    /// links, from the scan result).
    pub fn peer(&self) -> Option<NodeId> {
        self.peer
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether the link carries traffic.
    pub fn is_established(&self) -> bool {
        self.state == LinkState::Established
    }

    /// When the link was created.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Last time anything was received.
    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            tracing::trace!(conn = %self.id, from = %self.state, to = %state, "link state");
            self.state = state;
        }
    }

    pub(crate) fn set_peer(&mut self, peer: NodeId) {
        self.peer = Some(peer);
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        self.last_activity = now;
    }

    pub(crate) fn next_node_sync(&self) -> Timestamp {
        self.next_node_sync
    }

    pub(crate) fn set_next_node_sync(&mut self, at: Timestamp) {
        self.next_node_sync = at;
    }

    /// Deadline for an answer to our last topology request.
    pub(crate) fn sync_deadline(&self) -> Option<Timestamp> {
        self.sync_deadline
    }

    pub(crate) fn arm_sync_deadline(&mut self, at: Timestamp) {
        self.sync_deadline = Some(at);
    }

    pub(crate) fn clear_sync_deadline(&mut self) {
        self.sync_deadline = None;
    }

    /// Queue a frame for transmission.
    ///
    /// Returns `false` when the frame was dropped because its priority
    /// level is full or the link is closing.
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        if self.state == LinkState::Closing {
            return false;
        }
        let priority = frame.priority;
        match self.outbound.push(frame, priority) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    conn = %self.id,
                    priority = priority.name(),
                    "outbound level full, dropping frame"
                );
                false
            }
        }
    }

    /// Take up to `max` frames in weighted priority order.
    pub fn drain(&mut self, max: usize) -> Vec<Frame> {
        self.outbound
            .pop_batch(max)
            .into_iter()
            .map(|(frame, _)| frame)
            .collect()
    }

    /// Frames waiting to go out.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Frames waiting at one priority.
    pub fn pending_priority(&self, priority: MessagePriority) -> usize {
        self.outbound.len_priority(priority)
    }

    /// Frames dropped because a level was full.
    pub fn dropped(&self) -> u64 {
        self.outbound.stats().total_dropped()
    }
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Handle list sized for a node's usual number of links.
pub type ConnectionIds = SmallVec<[ConnectionId; 8]>;

/// Generational arena of connections.
#[derive(Default)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in [`LinkState::Connecting`].
    pub fn insert(
        &mut self,
        direction: Direction,
        peer: Option<NodeId>,
        now: Timestamp,
    ) -> ConnectionId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                ConnectionId::from_parts(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: None,
                });
                ConnectionId::from_parts((self.slots.len() - 1) as u32, 0)
            }
        };
        self.slots[id.index as usize].conn = Some(Connection::new(id, direction, peer, now));
        self.len += 1;
        id
    }

    /// Resolve a handle.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_ref())
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_mut())
    }

    /// Remove a connection, freeing its slot.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let conn = slot.conn.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(conn)
    }

    /// Whether the handle resolves.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Live connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|s| s.conn.as_ref())
    }

    /// Live connections, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.slots.iter_mut().filter_map(|s| s.conn.as_mut())
    }

    /// Handles of all live connections.
    pub fn ids(&self) -> ConnectionIds {
        self.iter().map(Connection::id).collect()
    }

    /// Handles of established connections.
    pub fn established(&self) -> ConnectionIds {
        self.iter()
            .filter(|c| c.is_established())
            .map(Connection::id)
            .collect()
    }

    /// The connection to `peer`, if any.
    pub fn find_peer(&self, peer: NodeId) -> Option<ConnectionId> {
        self.iter()
            .find(|c| c.peer == Some(peer))
            .map(Connection::id)
    }

    /// The station (parent) link, if any.
    pub fn station(&self) -> Option<ConnectionId> {
        self.iter()
            .find(|c| c.direction == Direction::Station)
            .map(Connection::id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|c| (c.id, c.peer, c.state))).finish()
    }
}
