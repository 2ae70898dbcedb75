use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use grange_core::{ProtocolError, Zone};
use serde::{Deserialize, Serialize};

use crate::{Codec, MessageKind, PostcardCodec, decode_frame, encode_frame};

/// The protocol version this build speaks. A handshake carrying any other
/// value is refused with `Disconnect(ProtocolVersionMismatch)`.
pub const PROTOCOL_VERSION: u8 = 0;

bitflags! {
    /// Request flags byte.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RequestFlags: u8 {
        /// Fire-and-forget: the server sends no response.
        const ONE_WAY = 0b0000_0001;
    }
}

/// Client's opening message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub client_id: String,
    pub protocol_version: u8,
    pub features: BTreeSet<String>,
}

/// One grain type advertised in a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainManifestEntry {
    pub grain_type: String,
    pub properties: BTreeMap<String, String>,
}

/// One interface advertised in a manifest. Method ordinals are the
/// implicit positions within `methods`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceManifestEntry {
    pub interface_id: String,
    pub methods: Vec<String>,
}

/// Grain/interface metadata exchanged during handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestWire {
    pub grains: Vec<GrainManifestEntry>,
    pub interfaces: Vec<InterfaceManifestEntry>,
    /// Pairs of `(interface_id, grain_type)`.
    pub interface_to_grain: Vec<(String, String)>,
}

/// Server's acknowledgement, carrying its manifest and zone snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub server_id: String,
    pub manifest: ManifestWire,
    pub zone: Option<Zone>,
    /// Snapshot of the cluster's zone ownership as this server knows it.
    pub zone_map: Vec<(Zone, String)>,
}

/// One grain method invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub message_id: u128,
    pub grain_type: String,
    pub grain_key: String,
    pub interface_id: String,
    pub method_ordinal: u16,
    pub args: Vec<u8>,
    pub timeout_ms: u32,
    pub flags: u8,
}

impl Request {
    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_truncate(self.flags)
    }

    pub fn is_one_way(&self) -> bool {
        self.flags().contains(RequestFlags::ONE_WAY)
    }
}

/// Outcome discriminant carried by every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
    Denied,
    Timeout,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Error => "error",
            ResponseStatus::Denied => "denied",
            ResponseStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Completion of a request. `payload` is the result blob on `Ok` and a
/// structured [`crate::ErrorPayload`] otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub message_id: u128,
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
}

/// Liveness probe. A receiver echoes the timestamp back with its own
/// `source_id`, which lets the original sender measure the round trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub source_id: String,
    pub timestamp_micros: u64,
}

/// Why a session is going away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Graceful,
    IdleTimeout,
    ProtocolError,
    ProtocolVersionMismatch,
    AuthFailure,
    Overloaded,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Graceful => "graceful",
            DisconnectReason::IdleTimeout => "idle-timeout",
            DisconnectReason::ProtocolError => "protocol-error",
            DisconnectReason::ProtocolVersionMismatch => "protocol-version-mismatch",
            DisconnectReason::AuthFailure => "auth-failure",
            DisconnectReason::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// Session teardown notice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub text: String,
}

/// The closed set of protocol messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Request(Request),
    Response(Response),
    Heartbeat(Heartbeat),
    Disconnect(Disconnect),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake(_) => MessageKind::Handshake,
            Message::HandshakeAck(_) => MessageKind::HandshakeAck,
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Disconnect(_) => MessageKind::Disconnect,
        }
    }

    /// Serializes the body and frames it.
    pub fn encode(&self, max_frame_bytes: u32) -> Result<Bytes, ProtocolError> {
        let body = match self {
            Message::Handshake(m) => PostcardCodec::encode(m),
            Message::HandshakeAck(m) => PostcardCodec::encode(m),
            Message::Request(m) => PostcardCodec::encode(m),
            Message::Response(m) => PostcardCodec::encode(m),
            Message::Heartbeat(m) => PostcardCodec::encode(m),
            Message::Disconnect(m) => PostcardCodec::encode(m),
        }
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        encode_frame(self.kind(), &body, max_frame_bytes)
    }

    /// Deframes a datagram and decodes its body.
    pub fn decode(datagram: &[u8], max_frame_bytes: u32) -> Result<Message, ProtocolError> {
        let (kind, body) = decode_frame(datagram, max_frame_bytes)?;
        let malformed = |e: postcard::Error| ProtocolError::Malformed(e.to_string());
        Ok(match kind {
            MessageKind::Handshake => {
                Message::Handshake(PostcardCodec::decode(body).map_err(malformed)?)
            }
            MessageKind::HandshakeAck => {
                Message::HandshakeAck(PostcardCodec::decode(body).map_err(malformed)?)
            }
            MessageKind::Request => {
                Message::Request(PostcardCodec::decode(body).map_err(malformed)?)
            }
            MessageKind::Response => {
                Message::Response(PostcardCodec::decode(body).map_err(malformed)?)
            }
            MessageKind::Heartbeat => {
                Message::Heartbeat(PostcardCodec::decode(body).map_err(malformed)?)
            }
            MessageKind::Disconnect => {
                Message::Disconnect(PostcardCodec::decode(body).map_err(malformed)?)
            }
        })
    }
}
