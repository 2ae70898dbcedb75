use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use grange_core::ProtocolError;

/// Bytes before the body: one kind byte plus a big-endian u32 length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Kind discriminant tagging every frame.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake = 1,
    HandshakeAck = 2,
    Request = 3,
    Response = 4,
    Heartbeat = 5,
    Disconnect = 6,
}

impl MessageKind {
    /// Convert from the wire byte. Returns `None` for unknown
    /// discriminants; receivers must treat those as protocol errors, never
    /// skip them silently.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            1 => MessageKind::Handshake,
            2 => MessageKind::HandshakeAck,
            3 => MessageKind::Request,
            4 => MessageKind::Response,
            5 => MessageKind::Heartbeat,
            6 => MessageKind::Disconnect,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, ProtocolError> {
        MessageKind::from_u8(val).ok_or(ProtocolError::UnknownKind(val))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Handshake => "handshake",
            MessageKind::HandshakeAck => "handshake-ack",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// Frames a message body. Fails with `MessageTooLarge` when the body
/// exceeds `max_frame_bytes`.
pub fn encode_frame(
    kind: MessageKind,
    body: &[u8],
    max_frame_bytes: u32,
) -> Result<Bytes, ProtocolError> {
    if body.len() > max_frame_bytes as usize {
        return Err(ProtocolError::MessageTooLarge {
            len: body.len() as u32,
            max: max_frame_bytes,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u8(kind.as_u8());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Splits a datagram into kind and body.
///
/// The length field is validated against `max_frame_bytes` before the body
/// is touched, so an oversized frame is rejected from the five header
/// bytes alone. A datagram must contain exactly one frame; shortfall and
/// trailing bytes are both protocol errors.
pub fn decode_frame(
    datagram: &[u8],
    max_frame_bytes: u32,
) -> Result<(MessageKind, &[u8]), ProtocolError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            have: datagram.len(),
            need: FRAME_HEADER_LEN,
        });
    }
    let kind = MessageKind::try_from(datagram[0])?;
    let len = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    if len > max_frame_bytes {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    let body = &datagram[FRAME_HEADER_LEN..];
    let len = len as usize;
    if body.len() < len {
        return Err(ProtocolError::Truncated {
            have: body.len(),
            need: len,
        });
    }
    if body.len() > len {
        return Err(ProtocolError::TrailingBytes {
            extra: body.len() - len,
        });
    }
    Ok((kind, body))
}
