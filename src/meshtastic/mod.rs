//! # Meshtastic Radio Link
//!
//! Everything that knows about the radio lives below this module. The rest of the crate talks
//! to a radio through two traits:
//!
//! - [`Connector`] opens a link and hands back a [`Transport`]
//! - [`Transport`] sends text and trace requests, probes the link, and answers identity and
//!   node database queries
//!
//! Inbound traffic is not pulled through the trait. A connector is given the sending half of
//! an event channel and pushes decoded [`MeshEvent`]s into it for as long as the link lives.
//!
//! ## Canonical records
//!
//! Radios report node information in several shapes (the config dump at connect time, NODEINFO
//! packets, neighbour reports). All of them are folded into a single [`NodeRecord`] at the
//! ingestion boundary so downstream code never inspects raw protobuf structures.
//!
//! ## Errors
//!
//! Transport calls return [`TransportError`]. Its [`ErrorKind`] decides recovery: only
//! [`ErrorKind::Link`] failures demote the connection.
//!
//! ```toml
//! [meshtastic]
//! connection = "tcp"        # or "serial"
//! host = "192.168.1.50"
//! port = 4403
//! serial_device = "/dev/ttyUSB0"
//! baud_rate = 115200
//! ```

pub mod framer;
pub mod proto;
pub mod stream;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use stream::{LinkParams, StreamConnector};

/// A 32-bit Meshtastic node number, displayed as `!deadbeef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const BROADCAST: NodeId = NodeId(0xffff_ffff);

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    /// Accepts `!deadbeef`, `0xDEADBEEF` or a decimal node number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix('!') {
            u32::from_str_radix(hex, 16)
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            s.parse::<u32>()
        };
        parsed
            .map(NodeId)
            .map_err(|_| format!("invalid node id '{}'", s))
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Recovery class of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The link itself broke (reset, broken pipe, OS-level I/O). Forces a reconnect.
    Link,
    /// Anything else surfaced by a transport call. Logged, link state untouched.
    Application,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link failure: {0}")]
    Link(String),
    #[error("{0}")]
    Application(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Link(_) => ErrorKind::Link,
            TransportError::Application(_) => ErrorKind::Application,
        }
    }

    pub fn is_link(&self) -> bool {
        self.kind() == ErrorKind::Link
    }

    pub fn link(msg: impl fmt::Display) -> Self {
        TransportError::Link(msg.to_string())
    }

    pub fn app(msg: impl fmt::Display) -> Self {
        TransportError::Application(msg.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Link(e.to_string())
    }
}

impl From<prost::DecodeError> for TransportError {
    fn from(e: prost::DecodeError) -> Self {
        TransportError::Application(format!("protobuf decode: {}", e))
    }
}

impl From<prost::EncodeError> for TransportError {
    fn from(e: prost::EncodeError) -> Self {
        TransportError::Application(format!("protobuf encode: {}", e))
    }
}

/// Canonical node description produced by every ingestion path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub id: Option<NodeId>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    pub is_licensed: Option<bool>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
    pub via_mqtt: bool,
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

impl NodeRecord {
    /// Adapter for node entries from the radio's database dump.
    pub fn from_proto(info: &proto::NodeInfo) -> Self {
        let mut rec = match &info.user {
            Some(user) => Self::from_user(NodeId(info.num), user),
            None => NodeRecord {
                id: Some(NodeId(info.num)),
                ..Default::default()
            },
        };
        if info.last_heard > 0 {
            rec.last_heard = Utc.timestamp_opt(info.last_heard as i64, 0).single();
        }
        if info.snr != 0.0 {
            rec.snr = Some(info.snr);
        }
        rec.hops_away = info.hops_away;
        rec.via_mqtt = info.via_mqtt;
        rec
    }

    /// Adapter for a `User` payload announced by `from`.
    pub fn from_user(from: NodeId, user: &proto::User) -> Self {
        NodeRecord {
            id: Some(from),
            long_name: non_empty(&user.long_name),
            short_name: non_empty(&user.short_name),
            hw_model: Some(user.hw_model),
            role: Some(user.role),
            is_licensed: Some(user.is_licensed),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
    }
}

/// Decoded application payload of an inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    NodeInfo(NodeRecord),
    NeighborInfo { neighbors: usize },
    Traceroute(proto::RouteDiscovery),
    Routing { error: i32 },
    Other(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub id: u32,
    /// Id of the request this packet answers, when the sender set one.
    pub request_id: u32,
    pub payload: Payload,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub via_mqtt: bool,
}

impl InboundPacket {
    /// Hops consumed on the way to us, when the firmware reports both counters.
    pub fn hops_taken(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) if start >= limit => Some(start - limit),
            _ => None,
        }
    }

    pub fn is_direct_message(&self) -> bool {
        !self.to.is_broadcast()
    }

    /// Adapter from a decoded `MeshPacket`. Encrypted packets we cannot read yield `None`.
    pub fn from_proto(pkt: &proto::MeshPacket) -> Option<Self> {
        use prost::Message;
        use proto::mesh_packet::PayloadVariant;

        let data = match &pkt.payload_variant {
            Some(PayloadVariant::Decoded(d)) => d,
            _ => return None,
        };
        let from = NodeId(pkt.from);
        let payload = match proto::PortNum::try_from(data.portnum) {
            Ok(proto::PortNum::TextMessageApp) => {
                Payload::Text(String::from_utf8_lossy(&data.payload).into_owned())
            }
            Ok(proto::PortNum::NodeinfoApp) => match proto::User::decode(data.payload.as_slice()) {
                Ok(user) => Payload::NodeInfo(NodeRecord::from_user(from, &user)),
                Err(_) => Payload::Other(data.portnum),
            },
            Ok(proto::PortNum::NeighborinfoApp) => {
                match proto::NeighborInfo::decode(data.payload.as_slice()) {
                    Ok(ni) => Payload::NeighborInfo {
                        neighbors: ni.neighbors.len(),
                    },
                    Err(_) => Payload::Other(data.portnum),
                }
            }
            Ok(proto::PortNum::TracerouteApp) => {
                match proto::RouteDiscovery::decode(data.payload.as_slice()) {
                    Ok(rd) => Payload::Traceroute(rd),
                    Err(_) => Payload::Other(data.portnum),
                }
            }
            Ok(proto::PortNum::RoutingApp) => match proto::Routing::decode(data.payload.as_slice())
            {
                Ok(proto::Routing {
                    variant: Some(proto::routing::Variant::ErrorReason(code)),
                }) => Payload::Routing { error: code },
                Ok(_) => Payload::Routing {
                    error: proto::routing::ERROR_NONE,
                },
                Err(_) => Payload::Other(data.portnum),
            },
            _ => Payload::Other(data.portnum),
        };

        let hop_start = if pkt.hop_start > 0 {
            Some(pkt.hop_start)
        } else {
            None
        };
        Some(InboundPacket {
            from,
            to: NodeId(pkt.to),
            channel: pkt.channel,
            id: pkt.id,
            request_id: data.request_id,
            payload,
            rx_rssi: if pkt.rx_rssi != 0 { Some(pkt.rx_rssi) } else { None },
            rx_snr: if pkt.rx_snr != 0.0 { Some(pkt.rx_snr) } else { None },
            hop_start,
            hop_limit: hop_start.map(|_| pkt.hop_limit),
            via_mqtt: pkt.via_mqtt,
        })
    }
}

/// Events pushed from a live transport to the application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Packet(InboundPacket),
    /// Node database entry delivered outside of a packet (config dump, re-sync).
    Node(NodeRecord),
}

/// Local radio identity. Each field is one of the sources the station name can come from.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub node: Option<NodeId>,
    /// Owner as configured on the radio.
    pub owner_name: Option<String>,
    /// `user.long_name` of our own entry in the node database.
    pub node_info_name: Option<String>,
    /// Short name of our own node entry, as a last resort.
    pub short_name: Option<String>,
}

impl Identity {
    /// First non-empty name from owner, node info, then the short name.
    pub fn display_name(&self) -> String {
        [&self.owner_name, &self.node_info_name, &self.short_name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// A live link to a radio.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, text: &str, destination: NodeId) -> Result<(), TransportError>;

    /// Fire-and-forget; the answer arrives as an inbound packet.
    async fn send_trace_request(&self, target: NodeId, hop_limit: u32)
        -> Result<(), TransportError>;

    /// Cheap round trip used by the health check.
    async fn probe(&self) -> Result<(), TransportError>;

    async fn identity(&self) -> Result<Identity, TransportError>;

    async fn node_db(&self) -> Result<Vec<NodeRecord>, TransportError>;

    async fn close(&self);
}

/// Opens links. One connector lives for the whole process; each `open` is one connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError>;

    /// Short description for logs, e.g. `tcp 192.168.1.50:4403`.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn node_id_parse_and_display() {
        let id: NodeId = "!deadbeef".parse().unwrap();
        assert_eq!(id, NodeId(0xdeadbeef));
        assert_eq!(id.to_string(), "!deadbeef");
        assert_eq!("0x0000002A".parse::<NodeId>().unwrap(), NodeId(42));
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId(42));
        assert!("!xyz".parse::<NodeId>().is_err());
        assert!(NodeId(0xffffffff).is_broadcast());
    }

    #[test]
    fn identity_prefers_first_non_empty() {
        let ident = Identity {
            node: None,
            owner_name: Some("  ".into()),
            node_info_name: Some("Hilltop".into()),
            short_name: Some("HT".into()),
        };
        assert_eq!(ident.display_name(), "Hilltop");
        assert_eq!(Identity::default().display_name(), "");
    }

    #[test]
    fn io_errors_are_link_class() {
        let e: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(e.kind(), ErrorKind::Link);
        assert_eq!(TransportError::app("busy").kind(), ErrorKind::Application);
    }

    fn decoded(port: proto::PortNum, payload: Vec<u8>) -> proto::MeshPacket {
        proto::MeshPacket {
            from: 0x1234,
            to: 0xffffffff,
            hop_start: 3,
            hop_limit: 1,
            rx_rssi: -97,
            rx_snr: 6.25,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: port as i32,
                payload,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[test]
    fn adapts_text_packet() {
        let pkt = InboundPacket::from_proto(&decoded(proto::PortNum::TextMessageApp, b"ping".to_vec()))
            .expect("decoded");
        assert_eq!(pkt.payload, Payload::Text("ping".into()));
        assert_eq!(pkt.hops_taken(), Some(2));
        assert_eq!(pkt.rx_rssi, Some(-97));
        assert!(!pkt.is_direct_message());
    }

    #[test]
    fn adapts_nodeinfo_packet() {
        let user = proto::User {
            id: "!00001234".into(),
            long_name: "Ridge Relay".into(),
            short_name: "RR".into(),
            ..Default::default()
        };
        let pkt = InboundPacket::from_proto(&decoded(proto::PortNum::NodeinfoApp, user.encode_to_vec()))
            .expect("decoded");
        match pkt.payload {
            Payload::NodeInfo(rec) => {
                assert_eq!(rec.id, Some(NodeId(0x1234)));
                assert_eq!(rec.display_name(), Some("Ridge Relay"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn encrypted_packets_are_skipped() {
        let pkt = proto::MeshPacket {
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(vec![1, 2])),
            ..Default::default()
        };
        assert!(InboundPacket::from_proto(&pkt).is_none());
    }
}
