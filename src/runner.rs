//! Async driver for a single mesh node.
//!
//! [`MeshRunner`] owns the clock and the event loop: it ticks the mesh when
//! its scheduler is due, feeds it link-layer events and pushes every frame
//! and [`LifecycleAction`] it produces through a [`Transport`]. The
//! application talks to the running node through a cloneable
//! [`MeshHandle`].
//!
//! # Example
//!
//! ```ignore
//! use treemesh::{ChannelTransport, Mesh, MeshConfig, MeshRunner, NodeId, NoopDelegate};
//!
//! let mesh = Mesh::new(NodeId::new(7), MeshConfig::default(), NoopDelegate)?;
//! let (transport, outbound) = ChannelTransport::bounded(256);
//! let (runner, handle) = MeshRunner::new(mesh, transport);
//!
//! tokio::spawn(runner.run());
//!
//! // Radio driver: execute `outbound` and report back through `handle`.
//! handle.deliver(LinkEvent::UplinkStatus(true)).await?;
//! handle.with_mesh(|mesh, _| mesh.send_broadcast("hello"));
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::connection::Direction;
use crate::error::Result;
use crate::lifecycle::{LifecycleAction, ScanResult};
use crate::mesh::{Mesh, MeshDelegate};
use crate::transport::Transport;
use crate::types::{duration_micros, ConnectionId, NodeId, Timestamp};

/// Longest the loop sleeps when the scheduler has nothing pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Something the link layer observed.
#[derive(Debug)]
pub enum LinkEvent {
    /// A scan finished.
    ScanComplete(Vec<ScanResult>),
    /// A connection came up. The runner answers on `reply` with the handle
    /// the mesh assigned to it.
    Connected {
        /// Which side opened the link.
        direction: Direction,
        /// Peer id, when known from the scan.
        peer: Option<NodeId>,
        /// Receives the new connection handle.
        reply: Option<oneshot::Sender<ConnectionId>>,
    },
    /// A connection attempt failed.
    ConnectFailed(NodeId),
    /// A connection went down.
    Disconnected(ConnectionId),
    /// Bytes arrived on a connection.
    Received(ConnectionId, Bytes),
    /// Result of an uplink bring-up.
    UplinkStatus(bool),
}

struct Shared<D: MeshDelegate> {
    mesh: Mutex<Mesh<D>>,
    wake: Notify,
    started: Instant,
}

impl<D: MeshDelegate> Shared<D> {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(duration_micros(self.started.elapsed()))
    }
}

/// Application side of a running node.
pub struct MeshHandle<D: MeshDelegate> {
    shared: Arc<Shared<D>>,
    events: async_channel::Sender<LinkEvent>,
}

impl<D: MeshDelegate> Clone for MeshHandle<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            events: self.events.clone(),
        }
    }
}

impl<D: MeshDelegate> MeshHandle<D> {
    /// Hand a link-layer event to the runner.
    pub async fn deliver(&self, event: LinkEvent) -> Result<()> {
        self.events.send(event).await?;
        Ok(())
    }

    /// Report a new connection and wait for its handle.
    pub async fn connected(
        &self,
        direction: Direction,
        peer: Option<NodeId>,
    ) -> Result<ConnectionId> {
        let (tx, rx) = oneshot::channel();
        self.deliver(LinkEvent::Connected {
            direction,
            peer,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| crate::Error::Shutdown)
    }

    /// Run `f` against the mesh, then let the runner flush its output.
    ///
    /// The mesh is locked while `f` runs; keep it short.
    pub fn with_mesh<R>(&self, f: impl FnOnce(&mut Mesh<D>, Timestamp) -> R) -> R {
        let now = self.shared.now();
        let out = {
            let mut mesh = self.shared.mesh.lock();
            f(&mut mesh, now)
        };
        self.shared.wake.notify_one();
        out
    }

    /// Local time as seen by the runner.
    pub fn now(&self) -> Timestamp {
        self.shared.now()
    }

    /// Stop the runner once queued events are processed.
    pub fn shutdown(&self) {
        self.events.close();
    }

    /// Whether the runner has been told to stop.
    pub fn is_shutdown(&self) -> bool {
        self.events.is_closed()
    }
}

/// Drives a [`Mesh`] from tokio timers and a link event channel.
pub struct MeshRunner<D: MeshDelegate, T> {
    shared: Arc<Shared<D>>,
    events: async_channel::Receiver<LinkEvent>,
    transport: T,
}

impl<D, T> MeshRunner<D, T>
where
    D: MeshDelegate,
    T: Transport,
{
    /// Wrap `mesh`. Its clock starts now.
    pub fn new(mesh: Mesh<D>, transport: T) -> (Self, MeshHandle<D>) {
        let shared = Arc::new(Shared {
            mesh: Mutex::new(mesh),
            wake: Notify::new(),
            started: Instant::now(),
        });
        let (tx, rx) = async_channel::unbounded();
        let handle = MeshHandle {
            shared: shared.clone(),
            events: tx,
        };
        (
            Self {
                shared,
                events: rx,
                transport,
            },
            handle,
        )
    }

    /// Run until [`MeshHandle::shutdown`] is called or every handle is
    /// dropped.
    pub async fn run(self) {
        tracing::info!(node = %self.shared.mesh.lock().id(), "mesh runner started");
        loop {
            self.tick();
            self.flush().await;

            let now = self.shared.now();
            let wait = self
                .shared
                .mesh
                .lock()
                .next_deadline(now)
                .map_or(IDLE_WAIT, |at| at.saturating_duration_since(now));

            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.apply(event),
                    Err(_) => break,
                },
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.flush().await;
        tracing::info!(node = %self.shared.mesh.lock().id(), "mesh runner stopped");
    }

    fn tick(&self) {
        let now = self.shared.now();
        let mut mesh = self.shared.mesh.lock();
        if mesh.next_deadline(now).is_some_and(|at| at <= now) {
            mesh.tick(now);
        }
    }

    fn apply(&self, event: LinkEvent) {
        let now = self.shared.now();
        let mut mesh = self.shared.mesh.lock();
        match event {
            LinkEvent::ScanComplete(results) => mesh.on_scan_complete(now, results),
            LinkEvent::Connected {
                direction,
                peer,
                reply,
            } => {
                let conn = mesh.on_connected(now, direction, peer);
                if let Some(reply) = reply {
                    let _ = reply.send(conn);
                }
            }
            LinkEvent::ConnectFailed(node) => mesh.on_connect_failed(now, node),
            LinkEvent::Disconnected(conn) => mesh.on_disconnected(now, conn),
            LinkEvent::Received(conn, data) => {
                if let Err(err) = mesh.handle_bytes(now, conn, &data) {
                    tracing::debug!(conn = %conn, error = %err, "dropping inbound data");
                }
            }
            LinkEvent::UplinkStatus(ok) => mesh.on_uplink_status(now, ok),
        }
    }

    async fn flush(&self) {
        let (actions, frames) = {
            let mut mesh = self.shared.mesh.lock();
            let actions: Vec<LifecycleAction> = std::iter::from_fn(|| mesh.poll_action()).collect();
            (actions, mesh.poll_transmit(usize::MAX))
        };

        for action in actions {
            if let Err(err) = self.transport.perform(action.clone()).await {
                tracing::warn!(?action, error = %err, "link action failed");
            }
        }
        for (conn, frame) in frames {
            if let Err(err) = self.transport.send_to(conn, frame.encode_to_bytes()).await {
                tracing::warn!(conn = %conn, error = %err, "failed to send frame");
            }
        }
    }
}
