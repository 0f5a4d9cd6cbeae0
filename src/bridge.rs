//! Known uplink bridges and their health.
//!
//! Bridges broadcast a status report every few seconds. The tracker keeps
//! the latest report per bridge, judges health purely from the time since
//! the last report, and names a primary bridge:
//!
//! ```text
//! healthy && internet_connected
//!     └─▶ best router RSSI
//!          └─▶ lowest NodeId
//! ```
//!
//! Stale bridges are kept (and reported lost once) so a bridge that comes
//! back is recognised without a fresh discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::message::{BridgeRole, BridgeStatus, Coordination};
use crate::types::{NodeId, Timestamp};

/// Most bridges tracked at once.
pub const MAX_TRACKED_BRIDGES: usize = 20;

/// Priority assumed for bridges that never sent a coordination message.
pub const DEFAULT_BRIDGE_PRIORITY: u8 = 5;

/// What is known about one bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    /// Bridge node.
    pub node_id: NodeId,
    /// The bridge's own view of its internet access.
    pub internet_connected: bool,
    /// Bridge signal to its router, dBm.
    pub router_rssi: i8,
    /// Router channel.
    pub router_channel: u8,
    /// Bridge uptime at the last report, milliseconds.
    pub uptime_ms: u64,
    /// Gateway address.
    pub gateway: String,
    /// Local time of the last report.
    pub last_seen: Timestamp,
    /// Mesh time stamped into the last report.
    pub report_timestamp: u64,
    /// Coordination priority, 1 to 10.
    pub priority: u8,
    /// Announced role.
    pub role: BridgeRole,
    /// Announced load, percent.
    pub load: u8,
}

impl BridgeInfo {
    fn from_status(node_id: NodeId, status: &BridgeStatus, now: Timestamp) -> Self {
        Self {
            node_id,
            internet_connected: status.internet_connected,
            router_rssi: status.router_rssi,
            router_channel: status.router_channel,
            uptime_ms: status.uptime_ms,
            gateway: status.gateway.clone(),
            last_seen: now,
            report_timestamp: status.timestamp,
            priority: DEFAULT_BRIDGE_PRIORITY,
            role: BridgeRole::Primary,
            load: 0,
        }
    }

    /// Whether the last report is younger than `timeout`.
    pub fn is_healthy(&self, now: Timestamp, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < timeout
    }
}

/// How a node picks the bridge it sends uplink traffic to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeSelectionStrategy {
    /// Highest coordination priority, then best signal.
    PriorityBased,
    /// Rotate over healthy bridges.
    RoundRobin,
    /// Same as [`BridgeTracker::primary_bridge`].
    #[default]
    BestSignal,
}

/// Change worth telling the application about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A bridge became (or became again) reachable.
    Available {
        /// Bridge node.
        node: NodeId,
        /// Its internet flag.
        internet: bool,
    },
    /// A previously healthy bridge stopped reporting, or lost internet.
    Lost {
        /// Bridge node.
        node: NodeId,
    },
    /// The primary bridge changed.
    PrimaryChanged {
        /// Old primary.
        previous: Option<NodeId>,
        /// New primary.
        current: Option<NodeId>,
    },
}

/// Table of known bridges.
#[derive(Debug)]
pub struct BridgeTracker {
    timeout: Duration,
    strategy: BridgeSelectionStrategy,
    bridges: BTreeMap<NodeId, BridgeInfo>,
    available: BTreeSet<NodeId>,
    primary: Option<NodeId>,
    rr_cursor: usize,
}

impl BridgeTracker {
    /// Create a tracker treating bridges silent for `timeout` as unhealthy.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            strategy: BridgeSelectionStrategy::default(),
            bridges: BTreeMap::new(),
            available: BTreeSet::new(),
            primary: None,
            rr_cursor: 0,
        }
    }

    /// Set the uplink selection strategy.
    pub fn with_strategy(mut self, strategy: BridgeSelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Health timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the selection strategy.
    pub fn set_strategy(&mut self, strategy: BridgeSelectionStrategy) {
        self.strategy = strategy;
    }

    /// Record a status report from `from`.
    pub fn on_bridge_status(
        &mut self,
        from: NodeId,
        status: &BridgeStatus,
        now: Timestamp,
    ) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        match self.bridges.get_mut(&from) {
            Some(info) => {
                let (priority, role, load) = (info.priority, info.role, info.load);
                *info = BridgeInfo::from_status(from, status, now);
                info.priority = priority;
                info.role = role;
                info.load = load;
            }
            None => {
                if self.bridges.len() >= MAX_TRACKED_BRIDGES {
                    self.evict_stalest();
                }
                tracing::debug!(bridge = %from, rssi = status.router_rssi, "new bridge");
                self.bridges
                    .insert(from, BridgeInfo::from_status(from, status, now));
            }
        }

        if status.internet_connected {
            if self.available.insert(from) {
                tracing::info!(bridge = %from, "bridge available");
                events.push(BridgeEvent::Available {
                    node: from,
                    internet: true,
                });
            }
        } else if self.available.remove(&from) {
            tracing::warn!(bridge = %from, "bridge lost internet");
            events.push(BridgeEvent::Lost { node: from });
        }

        self.refresh_primary(now, &mut events);
        events
    }

    /// Record a coordination announcement. Unknown senders are ignored
    /// until their first status report.
    pub fn on_coordination(&mut self, from: NodeId, coordination: &Coordination, now: Timestamp) {
        if let Some(info) = self.bridges.get_mut(&from) {
            info.priority = coordination.priority.clamp(1, 10);
            info.role = coordination.role;
            info.load = coordination.load;
            info.last_seen = info.last_seen.max(now);
        }
    }

    /// Report bridges that went stale since the last check.
    ///
    /// Each healthy to unhealthy transition is reported once.
    pub fn check_health(&mut self, now: Timestamp) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        let stale: Vec<NodeId> = self
            .available
            .iter()
            .filter(|id| {
                self.bridges
                    .get(id)
                    .map_or(true, |info| !info.is_healthy(now, self.timeout))
            })
            .copied()
            .collect();
        for node in stale {
            self.available.remove(&node);
            tracing::warn!(bridge = %node, "bridge timed out");
            events.push(BridgeEvent::Lost { node });
        }
        self.refresh_primary(now, &mut events);
        events
    }

    fn refresh_primary(&mut self, now: Timestamp, events: &mut Vec<BridgeEvent>) {
        let current = self.primary_bridge(now).map(|b| b.node_id);
        if current != self.primary {
            tracing::info!(
                previous = ?self.primary,
                current = ?current,
                "primary bridge changed"
            );
            events.push(BridgeEvent::PrimaryChanged {
                previous: self.primary,
                current,
            });
            self.primary = current;
        }
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .bridges
            .values()
            .min_by_key(|b| (b.last_seen, b.node_id))
            .map(|b| b.node_id);
        if let Some(id) = stalest {
            tracing::debug!(bridge = %id, "bridge table full, replacing stalest entry");
            self.bridges.remove(&id);
            self.available.remove(&id);
        }
    }

    /// Whether `node` is a known bridge with a fresh report.
    pub fn is_healthy(&self, node: NodeId, now: Timestamp) -> bool {
        self.bridges
            .get(&node)
            .is_some_and(|b| b.is_healthy(now, self.timeout))
    }

    /// Best healthy, internet-connected bridge.
    pub fn primary_bridge(&self, now: Timestamp) -> Option<&BridgeInfo> {
        self.eligible(now)
            .min_by(|a, b| b.router_rssi.cmp(&a.router_rssi).then(a.node_id.cmp(&b.node_id)))
    }

    /// Whether a usable bridge exists.
    pub fn has_primary(&self, now: Timestamp) -> bool {
        self.primary_bridge(now).is_some()
    }

    /// Bridge to send the next uplink message through.
    pub fn select_bridge(&mut self, now: Timestamp) -> Option<NodeId> {
        match self.strategy {
            BridgeSelectionStrategy::BestSignal => self.primary_bridge(now).map(|b| b.node_id),
            BridgeSelectionStrategy::PriorityBased => self
                .eligible(now)
                .min_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(b.router_rssi.cmp(&a.router_rssi))
                        .then(a.node_id.cmp(&b.node_id))
                })
                .map(|b| b.node_id),
            BridgeSelectionStrategy::RoundRobin => {
                let ids: Vec<NodeId> = self.eligible(now).map(|b| b.node_id).collect();
                if ids.is_empty() {
                    return None;
                }
                let pick = ids[self.rr_cursor % ids.len()];
                self.rr_cursor = self.rr_cursor.wrapping_add(1);
                Some(pick)
            }
        }
    }

    fn eligible(&self, now: Timestamp) -> impl Iterator<Item = &BridgeInfo> {
        let timeout = self.timeout;
        self.bridges
            .values()
            .filter(move |b| b.internet_connected && b.is_healthy(now, timeout))
    }

    /// Healthy bridges, regardless of internet state.
    pub fn healthy_bridges(&self, now: Timestamp) -> Vec<&BridgeInfo> {
        self.bridges
            .values()
            .filter(|b| b.is_healthy(now, self.timeout))
            .collect()
    }

    /// Every tracked bridge.
    pub fn bridges(&self) -> impl Iterator<Item = &BridgeInfo> {
        self.bridges.values()
    }

    /// Lookup one bridge.
    pub fn get(&self, node: NodeId) -> Option<&BridgeInfo> {
        self.bridges.get(&node)
    }

    /// Forget a bridge, e.g. after it announced a role change.
    pub fn remove(&mut self, node: NodeId) -> Option<BridgeInfo> {
        self.available.remove(&node);
        self.bridges.remove(&node)
    }

    /// Number of tracked bridges.
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// Whether no bridge is tracked.
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(rssi: i8, internet: bool) -> BridgeStatus {
        BridgeStatus {
            internet_connected: internet,
            router_rssi: rssi,
            router_channel: 6,
            uptime_ms: 1_000,
            gateway: "10.0.0.1".into(),
            timestamp: 0,
        }
    }

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_health_window() {
        let mut tracker = BridgeTracker::new(Duration::from_secs(60));
        tracker.on_bridge_status(n(1), &status(-50, true), Timestamp::from_secs(10));
        assert!(tracker.is_healthy(n(1), Timestamp::from_secs(69)));
        assert!(!tracker.is_healthy(n(1), Timestamp::from_secs(70)));
        assert!(!tracker.is_healthy(n(2), Timestamp::from_secs(10)));
    }

    #[test]
    fn test_primary_prefers_signal_then_lowest_id() {
        let mut tracker = BridgeTracker::new(Duration::from_secs(60));
        let now = Timestamp::from_secs(1);
        tracker.on_bridge_status(n(3), &status(-60, true), now);
        tracker.on_bridge_status(n(2), &status(-40, false), now);
        tracker.on_bridge_status(n(9), &status(-45, true), now);
        tracker.on_bridge_status(n(4), &status(-45, true), now);
        assert_eq!(tracker.primary_bridge(now).map(|b| b.node_id), Some(n(4)));
    }

    #[test]
    fn test_lost_reported_once() {
        let mut tracker = BridgeTracker::new(Duration::from_secs(3));
        let events = tracker.on_bridge_status(n(1), &status(-50, true), Timestamp::ZERO);
        assert!(events.contains(&BridgeEvent::Available {
            node: n(1),
            internet: true
        }));
        assert!(events.contains(&BridgeEvent::PrimaryChanged {
            previous: None,
            current: Some(n(1))
        }));

        assert!(tracker.check_health(Timestamp::from_secs(2)).is_empty());
        let events = tracker.check_health(Timestamp::from_secs(4));
        assert_eq!(
            events,
            vec![
                BridgeEvent::Lost { node: n(1) },
                BridgeEvent::PrimaryChanged {
                    previous: Some(n(1)),
                    current: None
                }
            ]
        );
        assert!(tracker.check_health(Timestamp::from_secs(5)).is_empty());
        // Stale entries are kept.
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_table_bounded() {
        let mut tracker = BridgeTracker::new(Duration::from_secs(60));
        for i in 0..MAX_TRACKED_BRIDGES as u32 {
            tracker.on_bridge_status(n(i + 1), &status(-50, true), Timestamp::from_secs(i as u64));
        }
        tracker.on_bridge_status(n(100), &status(-50, true), Timestamp::from_secs(100));
        assert_eq!(tracker.len(), MAX_TRACKED_BRIDGES);
        assert!(tracker.get(n(1)).is_none());
        assert!(tracker.get(n(100)).is_some());
    }

    #[test]
    fn test_selection_strategies() {
        let now = Timestamp::from_secs(1);
        let mut tracker = BridgeTracker::new(Duration::from_secs(60))
            .with_strategy(BridgeSelectionStrategy::PriorityBased);
        tracker.on_bridge_status(n(1), &status(-40, true), now);
        tracker.on_bridge_status(n(2), &status(-70, true), now);
        tracker.on_coordination(
            n(2),
            &Coordination {
                priority: 9,
                role: BridgeRole::Primary,
                load: 10,
                peer_bridges: vec![n(1)],
                timestamp: 0,
            },
            now,
        );
        assert_eq!(tracker.select_bridge(now), Some(n(2)));

        tracker.set_strategy(BridgeSelectionStrategy::BestSignal);
        assert_eq!(tracker.select_bridge(now), Some(n(1)));

        tracker.set_strategy(BridgeSelectionStrategy::RoundRobin);
        let picks: Vec<_> = (0..4).filter_map(|_| tracker.select_bridge(now)).collect();
        assert_eq!(picks, vec![n(1), n(2), n(1), n(2)]);
    }

    #[test]
    fn test_coordination_survives_status_update() {
        let now = Timestamp::from_secs(1);
        let mut tracker = BridgeTracker::new(Duration::from_secs(60));
        tracker.on_bridge_status(n(1), &status(-40, true), now);
        tracker.on_coordination(
            n(1),
            &Coordination {
                priority: 15,
                role: BridgeRole::Secondary,
                load: 50,
                peer_bridges: vec![],
                timestamp: 0,
            },
            now,
        );
        tracker.on_bridge_status(n(1), &status(-42, true), now);
        let info = tracker.get(n(1)).unwrap();
        assert_eq!(info.priority, 10);
        assert_eq!(info.role, BridgeRole::Secondary);
        assert_eq!(info.router_rssi, -42);
    }
}
