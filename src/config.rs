//! Configuration for a mesh node.

use std::time::Duration;

use crate::error::{Error, Result};

/// Credentials for the uplink (router) network.
///
/// A node holding credentials may take part in bridge elections and, when
/// isolated, try to become a bridge on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UplinkCredentials {
    /// Router network name.
    pub ssid: String,
    /// Router password.
    pub password: String,
}

impl UplinkCredentials {
    /// Create a credential pair.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

/// Configuration options for a mesh node.
///
/// The defaults describe a battery-friendly deployment of a few dozen
/// nodes. [`MeshConfig::fast_failover`] shrinks every timer for tests and
/// small bench setups.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeshConfig {
    /// Mesh network name. Nodes only join peers advertising the same name.
    pub mesh_name: String,

    /// Shared mesh credential.
    pub mesh_password: String,

    /// Transport port the mesh listens on.
    ///
    /// Default: 5555
    pub port: u16,

    /// Preferred radio channel; `0` means auto-detect.
    ///
    /// Default: 0
    pub channel: u8,

    /// Maximum simultaneous mesh connections (parent plus children).
    ///
    /// Default: 4
    pub max_connections: usize,

    /// Base interval between neighbour scans.
    ///
    /// Scans run at half this interval while the topology is unknown and
    /// at four times this interval once connected and stable.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub scan_interval: Duration,

    /// Time a connection may stay silent, or stay in the handshake,
    /// before it is closed.
    ///
    /// Default: 10s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub node_timeout: Duration,

    /// Interval for re-sending topology reports to every neighbour.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub node_sync_interval: Duration,

    /// Connection attempts to the same peer before it is blocklisted.
    ///
    /// Default: 5
    pub connect_max_retries: u32,

    /// How long a failing peer stays on the blocklist.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub blocklist_duration: Duration,

    /// Consecutive empty scans before the mesh channel is re-acquired.
    ///
    /// Default: 6
    pub empty_scan_threshold: u16,

    /// Interval between clock synchronisation rounds per connection.
    ///
    /// Default: 10min
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub time_sync_interval: Duration,

    /// Interval used right after a large clock adjustment.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub time_sync_fast_interval: Duration,

    /// Weight given to a new offset sample, in `(0, 1]`.
    ///
    /// Default: 0.5
    pub time_smoothing: f64,

    /// Interval between bridge status broadcasts while acting as bridge.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub bridge_status_interval: Duration,

    /// A bridge not heard from for this long is unhealthy.
    ///
    /// Should be at least two to three status intervals.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub bridge_timeout: Duration,

    /// Uplink credentials, if this node may act as a bridge.
    pub uplink: Option<UplinkCredentials>,

    /// Bridge election settings.
    pub election: ElectionConfig,

    /// Offline message queue settings.
    pub queue: QueueConfig,

    /// Seed for the node's random source. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_name: "treemesh".to_string(),
            mesh_password: String::new(),
            port: 5555,
            channel: 0,
            max_connections: 4,
            scan_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(10),
            node_sync_interval: Duration::from_secs(60),
            connect_max_retries: 5,
            blocklist_duration: Duration::from_secs(60),
            empty_scan_threshold: 6,
            time_sync_interval: Duration::from_secs(600),
            time_sync_fast_interval: Duration::from_secs(5),
            time_smoothing: 0.5,
            bridge_status_interval: Duration::from_secs(30),
            bridge_timeout: Duration::from_secs(60),
            uplink: None,
            election: ElectionConfig::default(),
            queue: QueueConfig::default(),
            rng_seed: None,
        }
    }
}

impl MeshConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with short timers for tests and small meshes.
    ///
    /// - 2s scans, 3s node timeout
    /// - 1s bridge status, 3s bridge timeout
    /// - no election startup delay, 500ms grace, 2s collection window
    pub fn fast_failover() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            node_timeout: Duration::from_secs(3),
            node_sync_interval: Duration::from_secs(5),
            blocklist_duration: Duration::from_secs(10),
            time_sync_interval: Duration::from_secs(10),
            time_sync_fast_interval: Duration::from_secs(1),
            bridge_status_interval: Duration::from_secs(1),
            bridge_timeout: Duration::from_secs(3),
            election: ElectionConfig {
                startup_delay: Duration::ZERO,
                monitor_interval: Duration::from_millis(250),
                grace_period: Duration::from_millis(500),
                random_delay_min: Duration::ZERO,
                random_delay_max: Duration::from_millis(200),
                collection_window: Duration::from_secs(2),
                min_promotion_interval: Duration::from_secs(10),
                isolated_retry_interval: Duration::from_secs(5),
                ..ElectionConfig::default()
            },
            queue: QueueConfig {
                drain_interval: Duration::from_millis(500),
                ..QueueConfig::default()
            },
            ..Self::default()
        }
    }

    /// Configuration for sparse, battery powered deployments.
    ///
    /// - slower scans and status broadcasts
    /// - longer bridge timeout to tolerate sleeping relays
    pub fn low_power() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            node_timeout: Duration::from_secs(20),
            node_sync_interval: Duration::from_secs(120),
            time_sync_interval: Duration::from_secs(1800),
            bridge_status_interval: Duration::from_secs(60),
            bridge_timeout: Duration::from_secs(180),
            ..Self::default()
        }
    }

    /// Set the mesh identity.
    pub fn with_mesh(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.mesh_name = name.into();
        self.mesh_password = password.into();
        self
    }

    /// Set the transport port.
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the preferred channel (`0` = auto).
    pub const fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Set the maximum number of connections.
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the base scan interval.
    pub const fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the node timeout.
    pub const fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Set the blocklist duration.
    pub const fn with_blocklist_duration(mut self, duration: Duration) -> Self {
        self.blocklist_duration = duration;
        self
    }

    /// Set the clock synchronisation interval.
    pub const fn with_time_sync_interval(mut self, interval: Duration) -> Self {
        self.time_sync_interval = interval;
        self
    }

    /// Set the smoothing weight for clock offset samples.
    pub fn with_time_smoothing(mut self, alpha: f64) -> Self {
        self.time_smoothing = alpha;
        self
    }

    /// Set the bridge status broadcast interval.
    pub const fn with_bridge_status_interval(mut self, interval: Duration) -> Self {
        self.bridge_status_interval = interval;
        self
    }

    /// Set the bridge health timeout.
    pub const fn with_bridge_timeout(mut self, timeout: Duration) -> Self {
        self.bridge_timeout = timeout;
        self
    }

    /// Give this node uplink credentials.
    pub fn with_uplink(mut self, credentials: UplinkCredentials) -> Self {
        self.uplink = Some(credentials);
        self
    }

    /// Replace the election settings.
    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    /// Replace the queue settings.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Seed the node's random source for reproducible runs.
    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.mesh_name.is_empty() {
            return Err(Error::Config("mesh_name must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.scan_interval.is_zero() {
            return Err(Error::Config("scan_interval must be non-zero".into()));
        }
        if self.bridge_timeout < self.bridge_status_interval * 2 {
            return Err(Error::Config(
                "bridge_timeout should be at least 2x bridge_status_interval".into(),
            ));
        }
        if !(self.time_smoothing > 0.0 && self.time_smoothing <= 1.0) {
            return Err(Error::Config("time_smoothing must be in (0, 1]".into()));
        }
        self.election.validate()?;
        self.queue.validate()
    }
}

/// Bridge election settings.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElectionConfig {
    /// Whether this node takes part in bridge failover at all.
    ///
    /// Default: true
    pub enabled: bool,

    /// No election is started before this much time since boot, giving
    /// the node a chance to hear existing bridges first.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub startup_delay: Duration,

    /// How often bridge health is checked.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub monitor_interval: Duration,

    /// How long the bridge must be unhealthy or absent before candidacy.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub grace_period: Duration,

    /// Lower bound of the random delay added before candidacy.
    ///
    /// Default: 1s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub random_delay_min: Duration,

    /// Upper bound of the random delay added before candidacy.
    ///
    /// Default: 3s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub random_delay_max: Duration,

    /// How long candidacies are collected.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub collection_window: Duration,

    /// Minimum time between two role changes of this node.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub min_promotion_interval: Duration,

    /// Weakest uplink signal (dBm) accepted when a node would promote
    /// itself without competition.
    ///
    /// Default: -80
    pub minimum_bridge_rssi: i8,

    /// Consecutive empty scans during which elections are postponed in
    /// favour of a channel re-sync.
    ///
    /// Default: 3
    pub empty_scan_defer_threshold: u16,

    /// Interval between isolated promotion attempts.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub isolated_retry_interval: Duration,

    /// Isolated promotion attempts before backing off.
    ///
    /// Default: 5
    pub isolated_retry_max_attempts: u8,

    /// Back-off after the isolated attempts are used up.
    ///
    /// Default: 5min
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub isolated_retry_reset: Duration,

    /// Empty scans required before an isolated node tries to promote.
    ///
    /// Default: 6
    pub isolated_scan_threshold: u16,

    /// How long a promoting node waits for the driver to report the uplink
    /// before giving up and reverting to a regular node.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub uplink_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            random_delay_min: Duration::from_secs(1),
            random_delay_max: Duration::from_secs(3),
            collection_window: Duration::from_secs(5),
            min_promotion_interval: Duration::from_secs(60),
            minimum_bridge_rssi: -80,
            empty_scan_defer_threshold: 3,
            isolated_retry_interval: Duration::from_secs(60),
            isolated_retry_max_attempts: 5,
            isolated_retry_reset: Duration::from_secs(300),
            isolated_scan_threshold: 6,
            uplink_timeout: Duration::from_secs(30),
        }
    }
}

impl ElectionConfig {
    /// Disable bridge failover.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the collection window.
    pub const fn with_collection_window(mut self, window: Duration) -> Self {
        self.collection_window = window;
        self
    }

    /// Set the grace period.
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the startup delay.
    pub const fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Set the minimum inter-promotion interval.
    pub const fn with_min_promotion_interval(mut self, interval: Duration) -> Self {
        self.min_promotion_interval = interval;
        self
    }

    /// Set the minimum RSSI for uncontested promotion.
    pub const fn with_minimum_bridge_rssi(mut self, rssi: i8) -> Self {
        self.minimum_bridge_rssi = rssi;
        self
    }

    /// Set how long a promotion may wait for the uplink.
    pub const fn with_uplink_timeout(mut self, timeout: Duration) -> Self {
        self.uplink_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.uplink_timeout.is_zero() {
            return Err(Error::Config("uplink_timeout must be non-zero".into()));
        }
        if self.collection_window.is_zero() {
            return Err(Error::Config("collection_window must be non-zero".into()));
        }
        if self.random_delay_min > self.random_delay_max {
            return Err(Error::Config(
                "random_delay_min must not exceed random_delay_max".into(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(Error::Config("monitor_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Offline message queue settings.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueConfig {
    /// Maximum number of queued messages.
    ///
    /// Default: 500
    pub capacity: usize,

    /// Delivery attempts before a message is dropped.
    ///
    /// Default: 3
    pub max_attempts: u32,

    /// Mirror CRITICAL messages to the configured store.
    ///
    /// Default: false
    pub persist: bool,

    /// Also mirror HIGH messages when `persist` is set.
    ///
    /// Default: false
    pub persist_high: bool,

    /// How often the mesh tries to drain the queue toward a bridge.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            max_attempts: 3,
            persist: false,
            persist_high: false,
            drain_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Set the queue capacity.
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the retry ceiling.
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Enable persistence of CRITICAL (and optionally HIGH) messages.
    pub const fn with_persistence(mut self, persist: bool, include_high: bool) -> Self {
        self.persist = persist;
        self.persist_high = include_high;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(Error::Config("queue max_attempts must be in 1..=10".into()));
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.port, 5555);
        assert_eq!(config.channel, 0);
        assert_eq!(config.bridge_timeout, Duration::from_secs(60));
        assert_eq!(config.election.collection_window, Duration::from_secs(5));
        assert_eq!(config.election.grace_period, Duration::from_secs(5));
        assert_eq!(config.election.startup_delay, Duration::from_secs(60));
        assert_eq!(config.queue.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(MeshConfig::fast_failover().validate().is_ok());
        assert!(MeshConfig::low_power().validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MeshConfig::new()
            .with_mesh("garden", "secret")
            .with_port(6000)
            .with_channel(6)
            .with_uplink(UplinkCredentials::new("home", "pw"))
            .with_queue(QueueConfig::default().with_capacity(10));

        assert_eq!(config.mesh_name, "garden");
        assert_eq!(config.port, 6000);
        assert_eq!(config.channel, 6);
        assert!(config.uplink.is_some());
        assert_eq!(config.queue.capacity, 10);
    }

    #[test]
    fn test_validate_rejects_short_bridge_timeout() {
        let config = MeshConfig::default()
            .with_bridge_status_interval(Duration::from_secs(30))
            .with_bridge_timeout(Duration::from_secs(40));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_queue() {
        let config =
            MeshConfig::default().with_queue(QueueConfig::default().with_max_attempts(0));
        assert!(config.validate().is_err());

        let config = MeshConfig::default().with_queue(QueueConfig::default().with_capacity(0));
        assert!(config.validate().is_err());
    }
}
