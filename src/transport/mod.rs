//! Link layer abstraction.
//!
//! The mesh core never touches a radio. It produces two kinds of output:
//! encoded frames for a specific connection, and [`LifecycleAction`]s
//! (scan, connect, disconnect, bring up the uplink). A [`Transport`]
//! carries both to whatever owns the hardware.
//!
//! # Available Transports
//!
//! - [`ChannelTransport`]: hands everything to an async channel, for tests
//!   or for a driver living on another task
//! - [`NoopTransport`]: discards everything

use bytes::Bytes;
use std::future::Future;

use crate::lifecycle::LifecycleAction;
use crate::types::ConnectionId;

/// Carries frames and link-layer requests out of the mesh.
///
/// Frames must go to the given connection only. Routing already happened
/// inside the mesh, so a transport that fans frames out to several links
/// would duplicate traffic.
///
/// # Example
///
/// ```ignore
/// use treemesh::{ConnectionId, LifecycleAction, Transport};
///
/// struct Radio { /* driver handle */ }
///
/// impl Transport for Radio {
///     type Error = std::io::Error;
///
///     async fn send_to(&self, conn: ConnectionId, data: Bytes) -> Result<(), Self::Error> {
///         self.socket_for(conn)?.write_all(&data).await
///     }
///
///     async fn perform(&self, action: LifecycleAction) -> Result<(), Self::Error> {
///         self.driver.submit(action).await
///     }
/// }
/// ```
#[auto_impl::auto_impl(Box, Arc)]
pub trait Transport: Send + Sync + 'static {
    /// Error type for transport operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send an encoded frame on one connection.
    fn send_to(
        &self,
        conn: ConnectionId,
        data: Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Carry out a link-layer request.
    fn perform(
        &self,
        action: LifecycleAction,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Output of a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded frame for one connection.
    Frame(ConnectionId, Bytes),
    /// A link-layer request.
    Action(LifecycleAction),
}

/// A transport that forwards everything to a channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: async_channel::Sender<Outbound>,
}

impl ChannelTransport {
    /// Create a new channel transport.
    pub fn new(tx: async_channel::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Create a channel transport with a new bounded channel.
    pub fn bounded(capacity: usize) -> (Self, async_channel::Receiver<Outbound>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

/// Error type for channel transport.
#[derive(Debug, Clone)]
pub struct ChannelTransportError(pub String);

impl std::fmt::Display for ChannelTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel transport error: {}", self.0)
    }
}

impl std::error::Error for ChannelTransportError {}

impl Transport for ChannelTransport {
    type Error = ChannelTransportError;

    async fn send_to(&self, conn: ConnectionId, data: Bytes) -> Result<(), Self::Error> {
        self.tx
            .send(Outbound::Frame(conn, data))
            .await
            .map_err(|e| ChannelTransportError(e.to_string()))
    }

    async fn perform(&self, action: LifecycleAction) -> Result<(), Self::Error> {
        self.tx
            .send(Outbound::Action(action))
            .await
            .map_err(|e| ChannelTransportError(e.to_string()))
    }
}

/// A transport that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    type Error = std::convert::Infallible;

    async fn send_to(&self, _conn: ConnectionId, _data: Bytes) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn perform(&self, _action: LifecycleAction) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_channel_transport() {
        let (transport, rx) = ChannelTransport::bounded(16);
        let conn = ConnectionId::from_parts(3, 1);

        transport.send_to(conn, Bytes::from("hello")).await.unwrap();
        transport.perform(LifecycleAction::StartScan).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Frame(conn, Bytes::from("hello"))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Outbound::Action(LifecycleAction::StartScan)
        );
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (transport, rx) = ChannelTransport::bounded(1);
        drop(rx);
        let err = transport
            .perform(LifecycleAction::StartUplink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("channel transport error"));
    }

    #[tokio::test]
    async fn test_noop_transport_through_arc() {
        let transport = Arc::new(NoopTransport);
        transport
            .send_to(ConnectionId::from_parts(0, 0), Bytes::from("x"))
            .await
            .unwrap();
    }
}
