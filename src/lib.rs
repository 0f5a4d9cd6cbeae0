//! # treemesh
//!
//! Control plane for self-organizing, tree-shaped wireless meshes.
//!
//! Every node runs an access point for its children and, at most, one
//! station link to a parent. The links form a spanning tree that nodes
//! exchange with their neighbours, so each node knows the full topology
//! and routes along it. On top of the tree the crate synchronizes a mesh
//! clock, tracks which nodes bridge to the outside network, elects a new
//! bridge when the current one disappears and buffers uplink messages
//! while none is reachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application                              │
//! │          (MeshDelegate callbacks, typed message handlers)       │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ on_receive() / on_bridge_changed() ...
//! ┌────────────────────────────▼────────────────────────────────────┐
//! │                    MeshRunner (tokio feature)                   │
//! │        (timers, link event channel, Transport output)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                            Mesh                                 │
//! │   (sans-IO core: frames in, frames and link actions out)        │
//! ├────────────┬────────────┬────────────┬────────────┬─────────────┤
//! │ Topology + │ TimeSync   │ Lifecycle  │ Bridges +  │ Message     │
//! │ Router     │ (offset)   │ (scan/join)│ Election   │ Queue       │
//! └────────────┴────────────┴────────────┴────────────┴─────────────┘
//! ```
//!
//! ## API Entry Points
//!
//! | API | Use Case |
//! |-----|----------|
//! | [`Mesh`] | Core state machine, drive it from your own event loop |
//! | [`MeshRunner`] | Async driver over a [`Transport`] (requires `tokio`) |
//! | [`testing::SimNetwork`] | Many nodes in one process on a virtual clock |
//!
//! ## Driving a node
//!
//! The core never reads a clock and never performs IO. The driver:
//!
//! - calls [`Mesh::tick`] whenever [`Mesh::next_deadline`] is due
//! - executes [`LifecycleAction`]s from [`Mesh::poll_action`]
//! - sends frames from [`Mesh::poll_transmit`] on their connection
//! - reports scans, link changes, received bytes and uplink results back
//!
//! ## Example
//!
//! ```
//! use treemesh::{Mesh, MeshConfig, NodeId, NoopDelegate, Timestamp};
//!
//! let config = MeshConfig::default().with_mesh("garden", "hunter22");
//! let mut mesh = Mesh::new(NodeId::new(0x0A0B_0C0D), config, NoopDelegate).unwrap();
//!
//! mesh.tick(Timestamp::ZERO);
//! while let Some(action) = mesh.poll_action() {
//!     // hand `action` to the radio driver
//!     let _ = action;
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

mod bridge;
mod config;
mod connection;
mod election;
mod error;
mod health;
mod lifecycle;
mod mesh;
mod message;
mod priority;
mod queue;
mod router;
mod scheduler;
pub mod storage;
pub mod testing;
mod time_sync;
mod topology;
mod transport;
mod types;

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
mod runner;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

// Re-export identifier and time types
pub use types::{ConnectionId, NodeId, Timestamp};

// Re-export config types
pub use config::{ElectionConfig, MeshConfig, QueueConfig, UplinkCredentials};

// Re-export error types
pub use error::{Error, Result};

// Re-export health types
pub use health::{
    BridgeHealth, ConnectivityHealth, HealthReport, HealthReportBuilder, HealthStatus,
    QueueHealth,
};

// Re-export wire types
pub use message::{
    BridgeRole, BridgeStatus, ControlMessage, Coordination, Frame, Handler, HandlerRegistry,
    MessageType, Routing, Takeover, TimeSyncMsg, UplinkData, FRAME_HEADER_LEN, MAX_BODY_LEN,
};

// Re-export priority types
pub use priority::{MessagePriority, PriorityConfig, PriorityQueue, PriorityQueueStats};

// Re-export connection types
pub use connection::{Connection, ConnectionIds, ConnectionTable, Direction, LinkState};

// Re-export topology and routing types
pub use router::{Route, Router};
pub use topology::{
    MergeOutcome, NodeTree, TopologyManager, TreeSnapshot, MAX_TREE_DEPTH, MAX_TREE_NODES,
};

// Re-export time sync types
pub use time_sync::{
    delay_sample, offset_sample, should_adopt, SideInfo, SyncPhase, SyncSession,
    TimeSynchronizer, FAST_RESYNC_THRESHOLD_US,
};

// Re-export lifecycle types
pub use lifecycle::{
    LifecycleAction, LifecycleController, LinkView, ScanResult, STABILITY_MAX, STABILITY_STEP,
};

// Re-export bridge tracking types
pub use bridge::{
    BridgeEvent, BridgeInfo, BridgeSelectionStrategy, BridgeTracker, DEFAULT_BRIDGE_PRIORITY,
    MAX_TRACKED_BRIDGES,
};

// Re-export election types
pub use election::{
    compare_candidates, select_winner, ElectionAction, ElectionCandidate, ElectionCoordinator,
    ElectionInputs, ElectionOutcome, ElectionRecord, ElectionState, ELECTION_HISTORY_LEN,
    WEAK_SIGNAL_REASON,
};

// Re-export queue types
pub use queue::{FlushReport, MessageQueue, QueueState, QueueStats, QueuedMessage};

// Re-export scheduler types
pub use scheduler::{Scheduler, TaskId};

// Re-export the node itself
pub use mesh::{Mesh, MeshDelegate, NoopDelegate, Role, COORDINATION_INTERVAL, HOUSEKEEPING_INTERVAL};

// Re-export transport types
pub use transport::{ChannelTransport, ChannelTransportError, NoopTransport, Outbound, Transport};

// Re-export runner types (requires tokio feature)
#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub use runner::{LinkEvent, MeshHandle, MeshRunner};
