//! Connection lifecycle: scanning, connecting, blocklisting, reconfiguring.
//!
//! The controller is pure bookkeeping. It decides *what* should happen
//! and returns [`LifecycleAction`]s; the mesh and the radio layer carry
//! them out and report back through the `on_*` methods.
//!
//! ```text
//! Scanning ─▶ Connecting ─▶ Handshaking ─▶ Established ─▶ Closing
//!     ▲            │              │                          │
//!     └────────────┴── failure ───┴──────────────────────────┘
//!                  (5 failures ─▶ Blocked for 60s)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::config::MeshConfig;
use crate::topology::TreeSnapshot;
use crate::types::{ConnectionId, NodeId, Timestamp};

/// Stability gained per uneventful scan.
pub const STABILITY_STEP: u16 = 25;

/// Stability ceiling.
pub const STABILITY_MAX: u16 = 1000;

/// One access point seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Advertised mesh name.
    pub mesh_name: String,
    /// Node behind the access point.
    pub node_id: NodeId,
    /// Received signal strength, dBm. `0` means unknown.
    pub rssi: i8,
    /// Channel the access point is on.
    pub channel: u8,
}

/// Work the controller wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Scan for access points.
    StartScan,
    /// Open a station connection to `node`.
    Connect {
        /// Target node.
        node: NodeId,
        /// Channel it was seen on.
        channel: u8,
    },
    /// Close a connection.
    Disconnect {
        /// The link to close.
        conn: ConnectionId,
        /// Why.
        reason: &'static str,
    },
    /// Sweep all channels for the mesh.
    ReacquireChannel,
    /// Bring up the uplink to the router.
    StartUplink,
}

/// What the controller needs to know about the rest of the node.
#[derive(Debug, Clone, Copy)]
pub struct LinkView<'a> {
    /// Current tree.
    pub tree: &'a TreeSnapshot,
    /// The station link, if connected to a parent.
    pub station: Option<ConnectionId>,
    /// Live connections of any state.
    pub connections: usize,
}

/// Drives discovery and connection attempts.
#[derive(Debug)]
pub struct LifecycleController {
    mesh_name: String,
    scan_interval: Duration,
    max_connections: usize,
    max_retries: u32,
    blocklist_duration: Duration,
    empty_scan_threshold: u16,
    fixed_channel: bool,

    next_scan: Timestamp,
    scanning: bool,
    pending: Option<NodeId>,
    candidates: Vec<ScanResult>,
    failures: HashMap<NodeId, u32>,
    blocklist: HashMap<NodeId, Timestamp>,
    stability: u16,
    empty_scans: u16,
    is_root: bool,
    contains_root: bool,
}

impl LifecycleController {
    /// Create a controller; the first scan is due immediately.
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            mesh_name: config.mesh_name.clone(),
            scan_interval: config.scan_interval,
            max_connections: config.max_connections,
            max_retries: config.connect_max_retries,
            blocklist_duration: config.blocklist_duration,
            empty_scan_threshold: config.empty_scan_threshold,
            fixed_channel: config.channel != 0,
            next_scan: Timestamp::ZERO,
            scanning: false,
            pending: None,
            candidates: Vec::new(),
            failures: HashMap::new(),
            blocklist: HashMap::new(),
            stability: 0,
            empty_scans: 0,
            is_root: false,
            contains_root: false,
        }
    }

    /// Emit a scan when one is due.
    pub fn poll(&mut self, now: Timestamp) -> Option<LifecycleAction> {
        if self.scanning || now < self.next_scan {
            return None;
        }
        self.scanning = true;
        tracing::trace!(now = %now, "starting scan");
        Some(LifecycleAction::StartScan)
    }

    /// Evaluate a finished scan.
    pub fn on_scan_complete<R: Rng + ?Sized>(
        &mut self,
        now: Timestamp,
        results: Vec<ScanResult>,
        view: LinkView<'_>,
        rng: &mut R,
    ) -> Vec<LifecycleAction> {
        self.scanning = false;
        let mut actions = Vec::new();

        let seen_mesh = results.iter().any(|r| r.mesh_name == self.mesh_name);
        if seen_mesh {
            self.empty_scans = 0;
        } else {
            self.empty_scans = self.empty_scans.saturating_add(1);
        }

        self.candidates = self.filter_candidates(now, results, view.tree);
        let unknown_visible = !self.candidates.is_empty();

        let disconnected = view.station.is_none() && view.connections == 0;
        if disconnected
            && !seen_mesh
            && self.fixed_channel
            && self.empty_scan_threshold > 0
            && self.empty_scans % self.empty_scan_threshold == 0
        {
            tracing::info!(
                empty_scans = self.empty_scans,
                "mesh not visible on configured channel, re-acquiring"
            );
            actions.push(LifecycleAction::ReacquireChannel);
        }

        match view.station {
            None => {
                if let Some(best) = self.next_candidate(view.connections) {
                    actions.push(best);
                }
            }
            Some(station) => {
                if unknown_visible && self.should_reconfigure(rng) {
                    tracing::info!(
                        stability = self.stability,
                        candidates = self.candidates.len(),
                        "reconfiguring toward unknown nodes"
                    );
                    actions.push(LifecycleAction::Disconnect {
                        conn: station,
                        reason: "reconfiguration",
                    });
                    if let Some(best) = self.next_candidate(view.connections.saturating_sub(1)) {
                        actions.push(best);
                    }
                    self.stability = 0;
                } else {
                    self.stability = (self.stability + STABILITY_STEP).min(STABILITY_MAX);
                }
            }
        }

        let connected = view.station.is_some() || view.connections > 0;
        self.next_scan = now + self.scan_delay(connected && !unknown_visible);
        actions
    }

    /// Reconfiguration odds fall with stability, and a rooted tree never
    /// reconfigures on its own.
    fn should_reconfigure<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.is_root || self.contains_root {
            return false;
        }
        let permille = STABILITY_MAX - self.stability;
        rng.random_range(0..STABILITY_MAX) < permille
    }

    fn next_candidate(&mut self, connections: usize) -> Option<LifecycleAction> {
        if self.pending.is_some() || connections >= self.max_connections {
            return None;
        }
        let best = self.candidates.first()?;
        self.pending = Some(best.node_id);
        tracing::debug!(node = %best.node_id, rssi = best.rssi, "connecting to candidate");
        Some(LifecycleAction::Connect {
            node: best.node_id,
            channel: best.channel,
        })
    }

    fn filter_candidates(
        &mut self,
        now: Timestamp,
        results: Vec<ScanResult>,
        tree: &TreeSnapshot,
    ) -> Vec<ScanResult> {
        let mut out: Vec<ScanResult> = results
            .into_iter()
            .filter(|r| r.mesh_name == self.mesh_name)
            .filter(|r| r.rssi != 0)
            .filter(|r| !tree.contains(r.node_id))
            .collect();
        out.retain(|r| !self.is_blocked(r.node_id, now));
        out.sort_by(|a, b| b.rssi.cmp(&a.rssi).then(a.node_id.cmp(&b.node_id)));
        out
    }

    fn scan_delay(&self, settled: bool) -> Duration {
        if settled {
            self.scan_interval * 4
        } else {
            self.scan_interval / 2
        }
    }

    /// A station connection to `node` came up.
    pub fn on_connected(&mut self, node: NodeId) {
        if self.pending == Some(node) {
            self.pending = None;
        }
        self.failures.remove(&node);
    }

    /// A connection attempt or handshake with `node` failed.
    ///
    /// Returns `true` when the node was blocklisted.
    pub fn on_connect_failed(&mut self, now: Timestamp, node: NodeId) -> bool {
        if self.pending == Some(node) {
            self.pending = None;
        }
        let count = self.failures.entry(node).or_insert(0);
        *count += 1;
        let blocked = *count >= self.max_retries;
        if blocked {
            self.failures.remove(&node);
            self.blocklist.insert(node, now + self.blocklist_duration);
            tracing::warn!(
                node = %node,
                duration_ms = self.blocklist_duration.as_millis() as u64,
                "blocklisting node after repeated failures"
            );
        }
        self.next_scan = self.next_scan.min(now + self.scan_interval / 2);
        blocked
    }

    /// A connection went away; rescan soon.
    ///
    /// `station_peer` is the target of a closed station link. An attempt
    /// still pending on it is abandoned without counting as a failure.
    pub fn on_disconnected(&mut self, now: Timestamp, station_peer: Option<NodeId>) {
        if station_peer.is_some() && self.pending == station_peer {
            self.pending = None;
        }
        self.next_scan = self.next_scan.min(now + self.scan_interval / 2);
    }

    /// Whether `node` is blocklisted. Expired entries are dropped here.
    pub fn is_blocked(&mut self, node: NodeId, now: Timestamp) -> bool {
        match self.blocklist.get(&node) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.blocklist.remove(&node);
                false
            }
            None => false,
        }
    }

    /// Take the node's uplink role: become root and bring up the uplink.
    pub fn reinit_as_bridge(&mut self) -> Vec<LifecycleAction> {
        self.set_root(true);
        self.stability = 0;
        vec![LifecycleAction::StartUplink]
    }

    /// Drop the uplink role.
    pub fn reinit_as_node(&mut self, now: Timestamp) {
        self.set_root(false);
        self.stability = 0;
        self.next_scan = now;
    }

    /// Mark this node as root.
    pub fn set_root(&mut self, root: bool) {
        self.is_root = root;
    }

    /// Record whether our tree contains a root.
    pub fn set_contains_root(&mut self, contains: bool) {
        self.contains_root = contains;
    }

    /// Current stability, `0..=1000`.
    pub fn stability(&self) -> u16 {
        self.stability
    }

    /// Consecutive scans that did not see the mesh.
    pub fn empty_scans(&self) -> u16 {
        self.empty_scans
    }

    /// Candidates from the last scan, best first.
    pub fn candidates(&self) -> &[ScanResult] {
        &self.candidates
    }

    /// When the next scan is due.
    pub fn next_scan(&self) -> Timestamp {
        self.next_scan
    }

    /// Number of blocklisted nodes, expired entries included.
    pub fn blocklist_len(&self) -> usize {
        self.blocklist.len()
    }
}
