use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MessageId;

/// Wire-level classification carried in error payloads.
///
/// This is what a server puts on the wire when an invocation fails; the
/// client maps it back into a [`CallError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No grain implements the requested interface on this server.
    UnknownInterface,
    /// The method ordinal does not exist on the grain.
    UnknownMethod,
    /// Argument decoding failed.
    InvalidArgument,
    /// The handler failed with an unclassified error.
    Internal,
    /// Authorization refused the call.
    Denied,
    /// The server refused the call under back-pressure.
    Overloaded,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::UnknownInterface => "unknown interface",
            ErrorCode::UnknownMethod => "unknown method",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Internal => "internal",
            ErrorCode::Denied => "denied",
            ErrorCode::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// Errors produced while framing or decoding protocol messages.
///
/// Any of these terminates the session that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame length field exceeds the configured ceiling.
    MessageTooLarge { len: u32, max: u32 },
    /// Datagram ended before the declared frame body.
    Truncated { have: usize, need: usize },
    /// Unrecognized kind discriminant.
    UnknownKind(u8),
    /// Datagram carried bytes past the declared frame body.
    TrailingBytes { extra: usize },
    /// Peer spoke an unrecognized protocol version.
    VersionMismatch { peer: u8 },
    /// Frame body failed structural decoding.
    Malformed(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MessageTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds the {} byte ceiling", len, max)
            }
            ProtocolError::Truncated { have, need } => {
                write!(f, "truncated frame: have {} bytes, need {}", have, need)
            }
            ProtocolError::UnknownKind(kind) => write!(f, "unknown message kind {:#04x}", kind),
            ProtocolError::TrailingBytes { extra } => {
                write!(f, "{} trailing bytes after frame body", extra)
            }
            ProtocolError::VersionMismatch { peer } => {
                write!(f, "peer protocol version {} is not supported", peer)
            }
            ProtocolError::Malformed(msg) => write!(f, "malformed frame body: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Every failure the runtime delivers to a caller classifies into one of
/// these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The request deadline expired locally.
    Timeout,
    /// The transport dropped before a response arrived.
    ConnectionLost,
    /// No connected server offers the requested interface.
    NoProvider(String),
    /// Dispatch back-pressure fired; the pending set is full.
    Overloaded,
    /// A message id was allocated twice; indicates a generator bug.
    DuplicateRequestId(MessageId),
    /// The session died on a malformed, unversioned, or oversized frame.
    Protocol(ProtocolError),
    /// Authorization refused the call; the session survives.
    Denied { reason: String },
    /// The method does not exist on the target grain. `method` is the
    /// name when known, or the ordinal rendered as `#n`.
    UnknownMethod { interface: String, method: String },
    /// Argument decoding failed on the server.
    InvalidArgument(String),
    /// The handler failed with an unclassified error.
    Internal(String),
    /// The caller canceled before completion.
    Canceled,
}

impl CallError {
    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Timeout => "timeout",
            CallError::ConnectionLost => "connection-lost",
            CallError::NoProvider(_) => "no-provider",
            CallError::Overloaded => "overloaded",
            CallError::DuplicateRequestId(_) => "duplicate-request-id",
            CallError::Protocol(_) => "protocol",
            CallError::Denied { .. } => "denied",
            CallError::UnknownMethod { .. } => "unknown-method",
            CallError::InvalidArgument(_) => "invalid-argument",
            CallError::Internal(_) => "internal",
            CallError::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout => write!(f, "request deadline expired"),
            CallError::ConnectionLost => write!(f, "connection lost before response"),
            CallError::NoProvider(interface) => {
                write!(f, "no connected server offers interface {}", interface)
            }
            CallError::Overloaded => write!(f, "pending request set is full"),
            CallError::DuplicateRequestId(id) => {
                write!(f, "message id {} allocated twice", id)
            }
            CallError::Protocol(e) => write!(f, "protocol error: {}", e),
            CallError::Denied { reason } => write!(f, "denied: {}", reason),
            CallError::UnknownMethod { interface, method } => {
                write!(f, "interface {} has no method {}", interface, method)
            }
            CallError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            CallError::Internal(msg) => write!(f, "handler failed: {}", msg),
            CallError::Canceled => write!(f, "canceled by caller"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        CallError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge {
            len: 200,
            max: 100,
        };
        let s = e.to_string();
        assert!(s.contains("200"));
        assert!(s.contains("100"));
    }

    #[test]
    fn call_error_kinds_are_stable() {
        assert_eq!(CallError::Timeout.kind(), "timeout");
        assert_eq!(CallError::Canceled.kind(), "canceled");
        assert_eq!(
            CallError::Denied {
                reason: "role below Admin".into()
            }
            .kind(),
            "denied"
        );
    }

    #[test]
    fn protocol_error_converts() {
        let e: CallError = ProtocolError::UnknownKind(0x7F).into();
        assert_eq!(e.kind(), "protocol");
        assert!(e.to_string().contains("0x7f"));
    }

    #[test]
    fn duplicate_request_id_carries_the_id() {
        let e = CallError::DuplicateRequestId(MessageId(42));
        assert!(e.to_string().contains(&MessageId(42).to_string()));
    }
}
