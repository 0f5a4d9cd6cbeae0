//! Health check API for a mesh node.
//!
//! Summarises connectivity, uplink and offline queue state into one
//! status for monitoring and alerting.
//!
//! ## Health Status
//!
//! - **Healthy**: connected, a bridge is reachable, the queue has room
//! - **Degraded**: still functional, e.g. no bridge or a filling queue
//! - **Unhealthy**: no mesh connection, or the queue is refusing messages
//!
//! ## Example
//!
//! ```ignore
//! let health = mesh.health(now);
//!
//! match health.status {
//!     HealthStatus::Healthy => {}
//!     HealthStatus::Degraded => tracing::warn!("{}", health.message),
//!     HealthStatus::Unhealthy => tracing::error!("{}", health.message),
//! }
//! ```

use crate::queue::QueueState;
use crate::types::{NodeId, Timestamp};

/// Overall health of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,

    /// Functional with reduced guarantees.
    ///
    /// Examples: no bridge reachable, election running, queue nearly full.
    Degraded,

    /// Messages cannot currently leave this node.
    ///
    /// Examples: no mesh connection, queue full.
    Unhealthy,
}

impl HealthStatus {
    /// Check if the status is healthy.
    pub const fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Check if the status is degraded or worse.
    pub const fn is_degraded(&self) -> bool {
        !matches!(self, HealthStatus::Healthy)
    }

    /// Check if the status is unhealthy.
    pub const fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Detailed health report.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,

    /// Human-readable reason for the status.
    pub message: String,

    /// Link and topology state.
    pub connectivity: ConnectivityHealth,

    /// Uplink state.
    pub bridge: BridgeHealth,

    /// Offline queue state.
    pub queue: QueueHealth,

    /// When the report was taken.
    pub timestamp: Timestamp,
}

impl HealthReport {
    /// Create a report, deriving the status from its parts.
    pub fn new(
        connectivity: ConnectivityHealth,
        bridge: BridgeHealth,
        queue: QueueHealth,
        timestamp: Timestamp,
    ) -> Self {
        let (status, message) = Self::compute_status(&connectivity, &bridge, &queue);
        Self {
            status,
            message,
            connectivity,
            bridge,
            queue,
            timestamp,
        }
    }

    fn compute_status(
        connectivity: &ConnectivityHealth,
        bridge: &BridgeHealth,
        queue: &QueueHealth,
    ) -> (HealthStatus, String) {
        if queue.state == QueueState::Full {
            return (
                HealthStatus::Unhealthy,
                format!("Offline queue full ({} messages)", queue.len),
            );
        }

        if connectivity.established == 0 {
            if bridge.is_bridge {
                return (
                    HealthStatus::Degraded,
                    "Bridge has no mesh connections".to_string(),
                );
            }
            return (HealthStatus::Unhealthy, "No mesh connections".to_string());
        }

        if bridge.election_running {
            return (
                HealthStatus::Degraded,
                "Bridge election in progress".to_string(),
            );
        }

        if !bridge.is_bridge && bridge.primary.is_none() {
            return (HealthStatus::Degraded, "No bridge reachable".to_string());
        }

        if queue.state == QueueState::NearlyFull {
            return (
                HealthStatus::Degraded,
                format!(
                    "Offline queue at {:.0}% capacity",
                    queue.utilization() * 100.0
                ),
            );
        }

        (HealthStatus::Healthy, "Operating normally".to_string())
    }

    /// Check if the node can still move messages (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        !self.status.is_unhealthy()
    }
}

/// Link and topology health.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityHealth {
    /// Live connections, handshaking ones included.
    pub connections: usize,

    /// Connections that completed the handshake.
    pub established: usize,

    /// Nodes in the local tree view, self included.
    pub known_nodes: usize,

    /// Configured connection limit.
    pub max_connections: usize,
}

/// Uplink health.
#[derive(Debug, Clone, Default)]
pub struct BridgeHealth {
    /// Whether this node is the bridge.
    pub is_bridge: bool,

    /// Best reachable bridge.
    pub primary: Option<NodeId>,

    /// Bridges with a fresh status report.
    pub healthy_bridges: usize,

    /// Whether an election is running locally.
    pub election_running: bool,
}

/// Offline queue health.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    /// Queued messages.
    pub len: usize,

    /// Queue capacity.
    pub capacity: usize,

    /// Fill level.
    pub state: QueueState,
}

impl QueueHealth {
    /// Fill ratio (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }
}

/// Builder for health reports.
#[derive(Debug, Default)]
pub struct HealthReportBuilder {
    connectivity: ConnectivityHealth,
    bridge: BridgeHealth,
    queue_len: usize,
    queue_capacity: usize,
    queue_state: Option<QueueState>,
    timestamp: Timestamp,
}

impl HealthReportBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection counts.
    pub fn connections(mut self, total: usize, established: usize, max: usize) -> Self {
        self.connectivity.connections = total;
        self.connectivity.established = established;
        self.connectivity.max_connections = max;
        self
    }

    /// Set the size of the local tree view.
    pub fn known_nodes(mut self, count: usize) -> Self {
        self.connectivity.known_nodes = count;
        self
    }

    /// Set uplink state.
    pub fn bridge(
        mut self,
        is_bridge: bool,
        primary: Option<NodeId>,
        healthy_bridges: usize,
    ) -> Self {
        self.bridge.is_bridge = is_bridge;
        self.bridge.primary = primary;
        self.bridge.healthy_bridges = healthy_bridges;
        self
    }

    /// Set whether an election is running.
    pub fn election_running(mut self, running: bool) -> Self {
        self.bridge.election_running = running;
        self
    }

    /// Set queue state.
    pub fn queue(mut self, len: usize, capacity: usize, state: QueueState) -> Self {
        self.queue_len = len;
        self.queue_capacity = capacity;
        self.queue_state = Some(state);
        self
    }

    /// Set the report time.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build the report.
    pub fn build(self) -> HealthReport {
        let queue = QueueHealth {
            len: self.queue_len,
            capacity: self.queue_capacity,
            state: self.queue_state.unwrap_or(QueueState::Empty),
        };
        HealthReport::new(self.connectivity, self.bridge, queue, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> HealthReportBuilder {
        HealthReportBuilder::new()
            .connections(2, 2, 4)
            .known_nodes(5)
            .bridge(false, Some(NodeId::new(1)), 1)
            .queue(0, 500, QueueState::Empty)
    }

    #[test]
    fn test_healthy_status() {
        let report = connected().build();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.is_operational());
    }

    #[test]
    fn test_unhealthy_without_connections() {
        let report = HealthReportBuilder::new()
            .connections(1, 0, 4)
            .queue(0, 500, QueueState::Empty)
            .build();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.is_operational());
        assert!(report.message.contains("No mesh connections"));
    }

    #[test]
    fn test_lone_bridge_is_degraded() {
        let report = HealthReportBuilder::new()
            .bridge(true, Some(NodeId::new(1)), 1)
            .queue(0, 500, QueueState::Empty)
            .build();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_degraded_without_bridge() {
        let report = connected().bridge(false, None, 0).build();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.message.contains("No bridge"));

        let report = connected()
            .bridge(false, None, 0)
            .election_running(true)
            .build();
        assert!(report.message.contains("election"));
    }

    #[test]
    fn test_queue_levels() {
        let report = connected().queue(400, 500, QueueState::NearlyFull).build();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.message.contains("80%"));

        let report = connected().queue(500, 500, QueueState::Full).build();
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_queue_utilization() {
        let queue = QueueHealth {
            len: 125,
            capacity: 500,
            state: QueueState::Normal,
        };
        assert_eq!(queue.utilization(), 0.25);
    }
}
