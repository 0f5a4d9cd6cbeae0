//! Wire messages.
//!
//! This module contains:
//! - [`Frame`] - the unit carried by the transport
//! - [`MessageType`] - reserved type identifiers
//! - [`ControlMessage`] - typed bodies of the reserved types
//! - [`HandlerRegistry`] - dispatch for application types

mod control;
mod registry;
mod types;

pub use control::{
    BridgeRole, BridgeStatus, ControlMessage, Coordination, Takeover, TimeSyncMsg,
    UplinkData,
};
pub use registry::{Handler, HandlerRegistry};
pub use types::{Frame, MessageType, Routing, FRAME_HEADER_LEN, MAX_BODY_LEN};
