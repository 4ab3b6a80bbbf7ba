//! # Meshtastic Ingestion Module
//!
//! Everything between a radio and the relay's router: raw frame acquisition
//! over HTTP ([`http`]) or a serial byte stream ([`serial`] + [`resync`]), link
//! health supervision ([`health`]), and the envelope decoder that turns bytes
//! into typed [`DecodedEnvelope`] values.
//!
//! ## Decoding rules
//!
//! A frame is first parsed as a `FromRadio` container. The populated variant
//! selects the envelope kind; containers carrying nothing the relay uses come
//! back as [`DecodedEnvelope::Unrecognized`]. Frames that are not valid
//! containers are retried as a bare `MeshPacket`, which is only trusted when it
//! names a sending node. Anything else is dropped; decode failures are values,
//! never panics, and never leave this module.

pub mod health;
pub mod http;
pub mod resync;
pub mod serial;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use prost::Message;
use std::fmt;
use thiserror::Error;

use crate::logutil::hex_snippet;
use crate::protobuf::meshtastic_generated as proto;

pub use health::{ConnectionHealthMonitor, ConnectionState, HealthVerdict};
pub use http::{Endpoint, HttpPoller};
pub use resync::{LineState, SerialFrameResynchronizer};

/// Opaque bytes from one transport read, tagged with where and when they arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub bytes: Bytes,
}

impl RawFrame {
    pub fn new(source: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            source: source.into(),
            received_at: Utc::now(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalQuality {
    pub snr: f32,
    pub rssi: i32,
}

/// Decoded application payload of a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketData {
    pub port: i32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    pub source_node_id: u32,
    pub sequence_id: u32,
    /// Unix seconds; 0 when the radio did not stamp the packet.
    pub receive_time: u32,
    pub signal: Option<SignalQuality>,
    /// `None` while the packet is still encrypted on the wire.
    pub data: Option<PacketData>,
}

impl MeshPacket {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            node_id: self.source_node_id,
            sequence_id: self.sequence_id,
        }
    }

    fn from_proto(pkt: &proto::MeshPacket) -> Self {
        use proto::mesh_packet::PayloadVariant as MPPayload;
        let signal = if pkt.rx_snr != 0.0 || pkt.rx_rssi != 0 {
            Some(SignalQuality {
                snr: pkt.rx_snr,
                rssi: pkt.rx_rssi,
            })
        } else {
            None
        };
        let data = match &pkt.payload_variant {
            Some(MPPayload::Decoded(d)) => Some(PacketData {
                port: d.portnum,
                payload: d.payload.clone(),
            }),
            _ => None,
        };
        Self {
            source_node_id: pkt.from,
            sequence_id: pkt.id,
            receive_time: pkt.rx_time,
            signal,
            data,
        }
    }
}

/// Identity of a physical message: sending node plus its per-node packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub node_id: u32,
    pub sequence_id: u32,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}_{}", self.node_id, self.sequence_id)
    }
}

/// One entry of the radio's node directory, or a node's self-announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeEntry {
    pub node_id: u32,
    pub user_id: String,
    pub short_label: String,
    pub long_label: String,
}

impl NodeEntry {
    fn from_user(node_id: u32, user: &proto::User) -> Self {
        Self {
            node_id,
            user_id: user.id.clone(),
            short_label: user.short_name.trim().to_string(),
            long_label: user.long_name.trim().to_string(),
        }
    }

    /// Parse the `User` record carried by a NODEINFO packet payload.
    pub fn from_user_payload(node_id: u32, payload: &[u8]) -> Option<Self> {
        proto::User::decode(payload)
            .ok()
            .map(|u| Self::from_user(node_id, &u))
    }

    pub fn has_label(&self) -> bool {
        !self.short_label.is_empty() || !self.long_label.is_empty()
    }
}

/// The radio reporting its own node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioInfo {
    pub node_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEnvelope {
    Packet(MeshPacket),
    NodeDirectory(NodeEntry),
    RadioIdentity(RadioInfo),
    Config,
    Unrecognized,
}

impl DecodedEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedEnvelope::Packet(_) => "packet",
            DecodedEnvelope::NodeDirectory(_) => "node_info",
            DecodedEnvelope::RadioIdentity(_) => "my_info",
            DecodedEnvelope::Config => "config",
            DecodedEnvelope::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeFailure {
    #[error("empty frame")]
    Empty,
    #[error("not a container ({container}) nor a packet ({packet})")]
    Malformed {
        container: prost::DecodeError,
        packet: prost::DecodeError,
    },
    #[error("packet without a sending node")]
    Anonymous,
}

/// Decode a transport frame. Failures are logged at debug and yield `None`.
pub fn decode(frame: &RawFrame) -> Option<DecodedEnvelope> {
    match try_decode(&frame.bytes) {
        Ok(env) => {
            trace!("{}: decoded {} ({} bytes)", frame.source, env.kind(), frame.bytes.len());
            Some(env)
        }
        Err(e) => {
            debug!(
                "{}: undecodable frame of {} bytes: {} [{}]",
                frame.source,
                frame.bytes.len(),
                e,
                hex_snippet(&frame.bytes, 50)
            );
            None
        }
    }
}

/// Decode raw bytes without frame context (used by the serial window search).
pub fn decode_bytes(bytes: &[u8]) -> Option<DecodedEnvelope> {
    try_decode(bytes).ok()
}

pub fn try_decode(bytes: &[u8]) -> Result<DecodedEnvelope, DecodeFailure> {
    use proto::from_radio::PayloadVariant as FRPayload;

    if bytes.is_empty() {
        return Err(DecodeFailure::Empty);
    }
    match proto::FromRadio::decode(bytes) {
        Ok(msg) => Ok(match msg.payload_variant {
            Some(FRPayload::Packet(pkt)) => DecodedEnvelope::Packet(MeshPacket::from_proto(&pkt)),
            Some(FRPayload::NodeInfo(info)) => {
                let entry = match &info.user {
                    Some(u) => NodeEntry::from_user(info.num, u),
                    None => NodeEntry {
                        node_id: info.num,
                        ..NodeEntry::default()
                    },
                };
                DecodedEnvelope::NodeDirectory(entry)
            }
            Some(FRPayload::MyInfo(mi)) => DecodedEnvelope::RadioIdentity(RadioInfo {
                node_id: mi.my_node_num,
            }),
            Some(FRPayload::Config(_)) => DecodedEnvelope::Config,
            // Some bare packets also parse as an (empty) container.
            _ => match proto::MeshPacket::decode(bytes) {
                Ok(pkt) if pkt.from != 0 => DecodedEnvelope::Packet(MeshPacket::from_proto(&pkt)),
                _ => DecodedEnvelope::Unrecognized,
            },
        }),
        Err(container) => match proto::MeshPacket::decode(bytes) {
            Ok(pkt) if pkt.from != 0 => Ok(DecodedEnvelope::Packet(MeshPacket::from_proto(&pkt))),
            Ok(_) => Err(DecodeFailure::Anonymous),
            Err(packet) => Err(DecodeFailure::Malformed { container, packet }),
        },
    }
}

#[cfg(test)]
pub(crate) mod test_frames {
    //! Protobuf encoders shared by unit tests.
    use super::proto;
    use prost::Message;

    pub fn data_packet(from: u32, id: u32, port: i32, payload: &[u8]) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            id,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: port,
                payload: payload.to_vec().into(),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    pub fn wrap(pkt: proto::MeshPacket) -> Vec<u8> {
        proto::FromRadio {
            id: 1,
            payload_variant: Some(proto::from_radio::PayloadVariant::Packet(pkt)),
        }
        .encode_to_vec()
    }

    pub fn text_frame(from: u32, id: u32, text: &str) -> Vec<u8> {
        wrap(data_packet(from, id, proto::PortNum::TextMessageApp as i32, text.as_bytes()))
    }
}
