//! Wire frame layout and reserved message types.
//!
//! Every message travels as one [`Frame`] over a reliable, ordered
//! transport. Framing of the byte stream itself is the transport's job;
//! this module only lays out the frame contents:
//!
//! ```text
//! [type u16][from u32][routing u8][dest u32][priority u8][len u32][body ...]
//! ```
//!
//! All integers are big-endian. Bodies use [`Bytes`] so forwarding a frame
//! to several links shares one buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::priority::MessagePriority;
use crate::types::NodeId;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 2 + 4 + 1 + 4 + 1 + 4;

/// Largest accepted frame body.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// Reserved message type identifiers.
///
/// Types `1..=19` belong to the core protocol. Types from
/// [`FIRST_APP_TYPE`](MessageType::FIRST_APP_TYPE) upward are application
/// defined, except for the bridge sub-range `610..=619`.
pub struct MessageType;

impl MessageType {
    /// Round-trip delay probe.
    pub const TIME_DELAY: u16 = 3;
    /// Clock synchronisation exchange.
    pub const TIME_SYNC: u16 = 4;
    /// Topology report, asking for the peer's report in return.
    pub const NODE_SYNC_REQUEST: u16 = 5;
    /// Topology report answering a request.
    pub const NODE_SYNC_REPLY: u16 = 6;
    /// Reserved for link control.
    pub const CONTROL: u16 = 7;
    /// Application broadcast without a registered type.
    pub const BROADCAST: u16 = 8;
    /// Application single-destination message without a registered type.
    pub const SINGLE: u16 = 9;

    /// Periodic bridge health report.
    pub const BRIDGE_STATUS: u16 = 610;
    /// Election candidacy.
    pub const BRIDGE_ELECTION: u16 = 611;
    /// A node announcing it took over the bridge role.
    pub const BRIDGE_TAKEOVER: u16 = 612;
    /// Multi-bridge coordination announcement.
    pub const BRIDGE_COORDINATION: u16 = 613;
    /// Queued uplink payload carried to the bridge.
    pub const UPLINK_DATA: u16 = 614;

    /// First type id an application may use.
    pub const FIRST_APP_TYPE: u16 = 20;

    /// Whether `ty` is owned by the mesh rather than the application.
    pub const fn is_reserved(ty: u16) -> bool {
        ty < Self::FIRST_APP_TYPE || (ty >= 610 && ty <= 619)
    }
}

/// How a frame is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Routing {
    /// Consumed by the direct neighbour only.
    Neighbour = 0,
    /// Routed hop by hop to `dest`.
    Single = 1,
    /// Flooded along the tree to every node.
    Broadcast = 2,
}

impl TryFrom<u8> for Routing {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Routing::Neighbour),
            1 => Ok(Routing::Single),
            2 => Ok(Routing::Broadcast),
            _ => Err(value),
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type identifier.
    pub msg_type: u16,
    /// Originating node.
    pub from: NodeId,
    /// Routing mode.
    pub routing: Routing,
    /// Destination for [`Routing::Single`], otherwise [`NodeId::NONE`].
    pub dest: NodeId,
    /// Priority used by every outbound queue along the path.
    pub priority: MessagePriority,
    /// Message body.
    pub body: Bytes,
}

impl Frame {
    /// A frame for the direct neighbour only.
    pub fn neighbour(msg_type: u16, from: NodeId, body: Bytes) -> Self {
        Self {
            msg_type,
            from,
            routing: Routing::Neighbour,
            dest: NodeId::NONE,
            priority: MessagePriority::High,
            body,
        }
    }

    /// A frame routed to a single node.
    pub fn single(msg_type: u16, from: NodeId, dest: NodeId, body: Bytes) -> Self {
        Self {
            msg_type,
            from,
            routing: Routing::Single,
            dest,
            priority: MessagePriority::Normal,
            body,
        }
    }

    /// A frame flooded to the whole mesh.
    pub fn broadcast(msg_type: u16, from: NodeId, body: Bytes) -> Self {
        Self {
            msg_type,
            from,
            routing: Routing::Broadcast,
            dest: NodeId::NONE,
            priority: MessagePriority::Normal,
            body,
        }
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Encode the frame into `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.msg_type);
        buf.put_u32(self.from.get());
        buf.put_u8(self.routing as u8);
        buf.put_u32(self.dest.get());
        buf.put_u8(self.priority as u8);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Encode the frame into a new buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Length of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }

    /// Decode one frame. Returns `None` on truncated or malformed input.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < FRAME_HEADER_LEN {
            return None;
        }
        let msg_type = buf.get_u16();
        let from = NodeId::new(buf.get_u32());
        let routing = Routing::try_from(buf.get_u8()).ok()?;
        let dest = NodeId::new(buf.get_u32());
        let priority = MessagePriority::try_from(buf.get_u8()).ok()?;
        let len = buf.get_u32() as usize;
        if len > MAX_BODY_LEN || buf.remaining() < len {
            return None;
        }
        if routing == Routing::Single && dest.is_none() {
            return None;
        }
        let body = buf.copy_to_bytes(len);
        Some(Self {
            msg_type,
            from,
            routing,
            dest,
            priority,
            body,
        })
    }

    /// Decode a frame from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut cursor = std::io::Cursor::new(data);
        Self::decode(&mut cursor)
    }

    /// Whether this frame carries a core or bridge protocol message.
    pub const fn is_protocol(&self) -> bool {
        MessageType::is_reserved(self.msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::single(42, NodeId::new(7), NodeId::new(9), Bytes::from_static(b"hi"))
            .with_priority(MessagePriority::Critical);
        let bytes = frame.encode_to_bytes();
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(Frame::decode_from_slice(&bytes), Some(frame));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = Frame::broadcast(30, NodeId::new(1), Bytes::from_static(b"payload"));
        let bytes = frame.encode_to_bytes();
        assert!(Frame::decode_from_slice(&bytes[..bytes.len() - 1]).is_none());
        assert!(Frame::decode_from_slice(&bytes[..4]).is_none());
    }

    #[test]
    fn test_bad_routing_rejected() {
        let mut bytes = Frame::broadcast(30, NodeId::new(1), Bytes::new())
            .encode_to_bytes()
            .to_vec();
        bytes[6] = 9;
        assert!(Frame::decode_from_slice(&bytes).is_none());
    }

    #[test]
    fn test_single_without_dest_rejected() {
        let frame = Frame::single(30, NodeId::new(1), NodeId::NONE, Bytes::new());
        assert!(Frame::decode_from_slice(&frame.encode_to_bytes()).is_none());
    }

    #[test]
    fn test_reserved_ranges() {
        assert!(MessageType::is_reserved(MessageType::TIME_SYNC));
        assert!(MessageType::is_reserved(19));
        assert!(!MessageType::is_reserved(20));
        assert!(MessageType::is_reserved(MessageType::BRIDGE_COORDINATION));
        assert!(!MessageType::is_reserved(620));
    }
}
