//! Typed bodies of the reserved protocol messages.
//!
//! A [`Frame`] whose type lies in the reserved ranges is decoded into a
//! [`ControlMessage`] once, right after the frame itself is decoded. All
//! integers are big-endian; strings are a `u16` length followed by UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{Frame, MessageType};
use crate::election::ElectionCandidate;
use crate::priority::MessagePriority;
use crate::topology::NodeTree;
use crate::types::NodeId;

/// Clock exchange step, shared by `TIME_SYNC` and `TIME_DELAY`.
///
/// `t0` is the requester's send time, `t1` the responder's receive time
/// and `t2` the responder's send time, each in the sender's local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncMsg {
    /// Ask the peer to start an exchange from its side.
    Start,
    /// Opening request.
    Request {
        /// Requester send time.
        t0: u64,
    },
    /// Answer carrying the responder's timestamps.
    Reply {
        /// Requester send time, echoed.
        t0: u64,
        /// Responder receive time.
        t1: u64,
        /// Responder send time.
        t2: u64,
    },
}

impl TimeSyncMsg {
    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            TimeSyncMsg::Start => buf.put_u8(0),
            TimeSyncMsg::Request { t0 } => {
                buf.put_u8(1);
                buf.put_u64(t0);
            }
            TimeSyncMsg::Reply { t0, t1, t2 } => {
                buf.put_u8(2);
                buf.put_u64(t0);
                buf.put_u64(t1);
                buf.put_u64(t2);
            }
        }
    }

    fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        match buf.get_u8() {
            0 => Some(TimeSyncMsg::Start),
            1 => {
                need(&*buf, 8)?;
                Some(TimeSyncMsg::Request { t0: buf.get_u64() })
            }
            2 => {
                need(&*buf, 24)?;
                Some(TimeSyncMsg::Reply {
                    t0: buf.get_u64(),
                    t1: buf.get_u64(),
                    t2: buf.get_u64(),
                })
            }
            _ => None,
        }
    }
}

/// Health report broadcast by a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Whether the bridge currently reaches the internet.
    pub internet_connected: bool,
    /// Signal strength to the router, dBm.
    pub router_rssi: i8,
    /// Router channel.
    pub router_channel: u8,
    /// Bridge uptime in milliseconds.
    pub uptime_ms: u64,
    /// Gateway address as text.
    pub gateway: String,
    /// Sender's mesh time when the report was built, microseconds.
    pub timestamp: u64,
}

/// Announcement that a node took over the bridge role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    /// New bridge.
    pub new_bridge: NodeId,
    /// Bridge being replaced, [`NodeId::NONE`] when there was none.
    pub previous_bridge: NodeId,
    /// Human readable reason.
    pub reason: String,
    /// New bridge's router signal, dBm.
    pub router_rssi: i8,
    /// Sender's mesh time, microseconds.
    pub timestamp: u64,
}

/// Role a bridge announces in multi-bridge setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeRole {
    /// Preferred uplink.
    Primary = 0,
    /// Standby uplink.
    Secondary = 1,
}

/// Multi-bridge coordination announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordination {
    /// Bridge priority, 1 (lowest) to 10 (highest).
    pub priority: u8,
    /// Announced role.
    pub role: BridgeRole,
    /// Load estimate in percent.
    pub load: u8,
    /// Other bridges this bridge knows about.
    pub peer_bridges: Vec<NodeId>,
    /// Sender's mesh time, microseconds.
    pub timestamp: u64,
}

/// Queued application payload travelling toward a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkData {
    /// Queue id at the origin.
    pub id: u32,
    /// Priority at the origin.
    pub priority: MessagePriority,
    /// Destination outside the mesh.
    pub destination: String,
    /// Opaque payload.
    pub payload: Bytes,
}

/// Decoded body of a reserved message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Topology report asking for one in return.
    NodeSyncRequest(NodeTree),
    /// Topology report answering a request.
    NodeSyncReply(NodeTree),
    /// Clock synchronisation step.
    TimeSync(TimeSyncMsg),
    /// Round-trip delay probe.
    TimeDelay(TimeSyncMsg),
    /// Bridge health report.
    BridgeStatus(BridgeStatus),
    /// Election candidacy.
    BridgeElection(ElectionCandidate),
    /// Bridge takeover announcement.
    BridgeTakeover(Takeover),
    /// Multi-bridge coordination.
    BridgeCoordination(Coordination),
    /// Uplink payload.
    UplinkData(UplinkData),
}

impl ControlMessage {
    /// Type id carried in the frame header.
    pub fn msg_type(&self) -> u16 {
        match self {
            ControlMessage::NodeSyncRequest(_) => MessageType::NODE_SYNC_REQUEST,
            ControlMessage::NodeSyncReply(_) => MessageType::NODE_SYNC_REPLY,
            ControlMessage::TimeSync(_) => MessageType::TIME_SYNC,
            ControlMessage::TimeDelay(_) => MessageType::TIME_DELAY,
            ControlMessage::BridgeStatus(_) => MessageType::BRIDGE_STATUS,
            ControlMessage::BridgeElection(_) => MessageType::BRIDGE_ELECTION,
            ControlMessage::BridgeTakeover(_) => MessageType::BRIDGE_TAKEOVER,
            ControlMessage::BridgeCoordination(_) => MessageType::BRIDGE_COORDINATION,
            ControlMessage::UplinkData(_) => MessageType::UPLINK_DATA,
        }
    }

    /// Encode the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            ControlMessage::NodeSyncRequest(tree) | ControlMessage::NodeSyncReply(tree) => {
                tree.encode(&mut buf)
            }
            ControlMessage::TimeSync(m) | ControlMessage::TimeDelay(m) => m.encode(&mut buf),
            ControlMessage::BridgeStatus(s) => {
                buf.put_u8(u8::from(s.internet_connected));
                buf.put_i8(s.router_rssi);
                buf.put_u8(s.router_channel);
                buf.put_u64(s.uptime_ms);
                put_str(&mut buf, &s.gateway);
                buf.put_u64(s.timestamp);
            }
            ControlMessage::BridgeElection(c) => {
                buf.put_u32(c.node_id.get());
                buf.put_i8(c.router_rssi);
                buf.put_u64(c.uptime_ms);
                buf.put_u32(c.free_memory);
            }
            ControlMessage::BridgeTakeover(t) => {
                buf.put_u32(t.new_bridge.get());
                buf.put_u32(t.previous_bridge.get());
                put_str(&mut buf, &t.reason);
                buf.put_i8(t.router_rssi);
                buf.put_u64(t.timestamp);
            }
            ControlMessage::BridgeCoordination(c) => {
                buf.put_u8(c.priority);
                buf.put_u8(c.role as u8);
                buf.put_u8(c.load);
                buf.put_u16(c.peer_bridges.len() as u16);
                for peer in &c.peer_bridges {
                    buf.put_u32(peer.get());
                }
                buf.put_u64(c.timestamp);
            }
            ControlMessage::UplinkData(u) => {
                buf.put_u32(u.id);
                buf.put_u8(u.priority as u8);
                put_str(&mut buf, &u.destination);
                buf.put_u32(u.payload.len() as u32);
                buf.put_slice(&u.payload);
            }
        }
        buf.freeze()
    }

    /// Decode the body of a frame of type `msg_type`.
    ///
    /// Returns `None` for application types and for malformed bodies.
    pub fn decode(msg_type: u16, body: &[u8]) -> Option<Self> {
        let mut buf = std::io::Cursor::new(body);
        let msg = match msg_type {
            MessageType::NODE_SYNC_REQUEST => {
                ControlMessage::NodeSyncRequest(NodeTree::decode(&mut buf)?)
            }
            MessageType::NODE_SYNC_REPLY => {
                ControlMessage::NodeSyncReply(NodeTree::decode(&mut buf)?)
            }
            MessageType::TIME_SYNC => ControlMessage::TimeSync(TimeSyncMsg::decode(&mut buf)?),
            MessageType::TIME_DELAY => ControlMessage::TimeDelay(TimeSyncMsg::decode(&mut buf)?),
            MessageType::BRIDGE_STATUS => {
                need(&buf, 11)?;
                let internet_connected = buf.get_u8() != 0;
                let router_rssi = buf.get_i8();
                let router_channel = buf.get_u8();
                let uptime_ms = buf.get_u64();
                let gateway = get_str(&mut buf)?;
                need(&buf, 8)?;
                ControlMessage::BridgeStatus(BridgeStatus {
                    internet_connected,
                    router_rssi,
                    router_channel,
                    uptime_ms,
                    gateway,
                    timestamp: buf.get_u64(),
                })
            }
            MessageType::BRIDGE_ELECTION => {
                need(&buf, 17)?;
                ControlMessage::BridgeElection(ElectionCandidate {
                    node_id: NodeId::new(buf.get_u32()),
                    router_rssi: buf.get_i8(),
                    uptime_ms: buf.get_u64(),
                    free_memory: buf.get_u32(),
                })
            }
            MessageType::BRIDGE_TAKEOVER => {
                need(&buf, 8)?;
                let new_bridge = NodeId::new(buf.get_u32());
                let previous_bridge = NodeId::new(buf.get_u32());
                let reason = get_str(&mut buf)?;
                need(&buf, 9)?;
                ControlMessage::BridgeTakeover(Takeover {
                    new_bridge,
                    previous_bridge,
                    reason,
                    router_rssi: buf.get_i8(),
                    timestamp: buf.get_u64(),
                })
            }
            MessageType::BRIDGE_COORDINATION => {
                need(&buf, 5)?;
                let priority = buf.get_u8();
                let role = match buf.get_u8() {
                    0 => BridgeRole::Primary,
                    1 => BridgeRole::Secondary,
                    _ => return None,
                };
                let load = buf.get_u8();
                let count = buf.get_u16() as usize;
                need(&buf, count * 4 + 8)?;
                let peer_bridges = (0..count).map(|_| NodeId::new(buf.get_u32())).collect();
                ControlMessage::BridgeCoordination(Coordination {
                    priority,
                    role,
                    load,
                    peer_bridges,
                    timestamp: buf.get_u64(),
                })
            }
            MessageType::UPLINK_DATA => {
                need(&buf, 5)?;
                let id = buf.get_u32();
                let priority = MessagePriority::try_from(buf.get_u8()).ok()?;
                let destination = get_str(&mut buf)?;
                need(&buf, 4)?;
                let len = buf.get_u32() as usize;
                need(&buf, len)?;
                ControlMessage::UplinkData(UplinkData {
                    id,
                    priority,
                    destination,
                    payload: buf.copy_to_bytes(len),
                })
            }
            _ => return None,
        };
        if buf.has_remaining() {
            return None;
        }
        Some(msg)
    }

    /// Decode the body of `frame`.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        Self::decode(frame.msg_type, &frame.body)
    }
}

fn need(buf: &impl Buf, n: usize) -> Option<()> {
    (buf.remaining() >= n).then_some(())
}

/// Length-prefixed UTF-8. Over-long strings are cut at the last
/// character boundary that fits.
fn put_str(buf: &mut BytesMut, s: &str) {
    let mut len = s.len().min(usize::from(u16::MAX));
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.put_u16(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

fn get_str(buf: &mut impl Buf) -> Option<String> {
    need(&*buf, 2)?;
    let len = buf.get_u16() as usize;
    need(&*buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) {
        let body = msg.encode();
        assert_eq!(ControlMessage::decode(msg.msg_type(), &body), Some(msg));
    }

    #[test]
    fn test_control_bodies() {
        roundtrip(ControlMessage::NodeSyncRequest(
            NodeTree::leaf(NodeId::new(4)).with_sub(NodeTree::leaf(NodeId::new(5))),
        ));
        roundtrip(ControlMessage::TimeSync(TimeSyncMsg::Reply {
            t0: 1,
            t1: 2,
            t2: 3,
        }));
        roundtrip(ControlMessage::BridgeStatus(BridgeStatus {
            internet_connected: true,
            router_rssi: -42,
            router_channel: 6,
            uptime_ms: 12_345,
            gateway: "192.168.1.1".into(),
            timestamp: 99,
        }));
        roundtrip(ControlMessage::BridgeTakeover(Takeover {
            new_bridge: NodeId::new(7),
            previous_bridge: NodeId::NONE,
            reason: "bridge timeout".into(),
            router_rssi: -60,
            timestamp: 5,
        }));
        roundtrip(ControlMessage::BridgeCoordination(Coordination {
            priority: 8,
            role: BridgeRole::Secondary,
            load: 30,
            peer_bridges: vec![NodeId::new(1), NodeId::new(2)],
            timestamp: 0,
        }));
        roundtrip(ControlMessage::UplinkData(UplinkData {
            id: 17,
            priority: MessagePriority::Critical,
            destination: "mqtt://alarms".into(),
            payload: Bytes::from_static(b"smoke"),
        }));
    }

    #[test]
    fn test_long_reason_cut_on_char_boundary() {
        // 65536 bytes of two-byte characters: the u16 limit falls mid-character.
        let msg = ControlMessage::BridgeTakeover(Takeover {
            new_bridge: NodeId::new(7),
            previous_bridge: NodeId::new(1),
            reason: "é".repeat(32_768),
            router_rssi: -60,
            timestamp: 5,
        });
        let body = msg.encode();
        let Some(ControlMessage::BridgeTakeover(decoded)) =
            ControlMessage::decode(MessageType::BRIDGE_TAKEOVER, &body)
        else {
            panic!("takeover with long reason did not decode");
        };
        assert_eq!(decoded.reason.len(), 65_534);
        assert_eq!(decoded.reason.chars().count(), 32_767);
        assert_eq!(decoded.new_bridge, NodeId::new(7));
    }

    #[test]
    fn test_application_type_is_not_control() {
        assert!(ControlMessage::decode(42, &[]).is_none());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut body = ControlMessage::BridgeElection(ElectionCandidate {
            node_id: NodeId::new(3),
            router_rssi: -50,
            uptime_ms: 1,
            free_memory: 2,
        })
        .encode()
        .to_vec();
        body.push(0);
        assert!(ControlMessage::decode(MessageType::BRIDGE_ELECTION, &body).is_none());
    }

    #[test]
    fn test_truncated_status_rejected() {
        let body = ControlMessage::BridgeStatus(BridgeStatus {
            internet_connected: false,
            router_rssi: 0,
            router_channel: 1,
            uptime_ms: 0,
            gateway: "gw".into(),
            timestamp: 0,
        })
        .encode();
        assert!(ControlMessage::decode(MessageType::BRIDGE_STATUS, &body[..body.len() - 3]).is_none());
    }
}
