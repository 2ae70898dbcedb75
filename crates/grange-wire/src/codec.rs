use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

/// Encoding format identifier for message body serialization.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Postcard: compact binary format, the wire default.
    Postcard = 1,
    /// JSON: human-readable, for debugging and tooling.
    Json = 2,
}

impl TryFrom<u16> for Encoding {
    type Error = UnknownEncoding;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Encoding::Postcard),
            2 => Ok(Encoding::Json),
            _ => Err(UnknownEncoding(v)),
        }
    }
}

impl From<Encoding> for u16 {
    fn from(encoding: Encoding) -> u16 {
        encoding as u16
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Postcard => write!(f, "postcard"),
            Encoding::Json => write!(f, "json"),
        }
    }
}

/// Error when converting from an unknown u16 encoding value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEncoding(pub u16);

impl fmt::Display for UnknownEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown encoding: {}", self.0)
    }
}

impl std::error::Error for UnknownEncoding {}

/// Structural serializer behind the protocol.
///
/// The runtime is agnostic to the blob format; everything goes through
/// this seam so the debug codec can be swapped in by tooling.
pub trait Codec {
    const ENCODING: Encoding;

    type EncodeError: std::error::Error;
    type DecodeError: std::error::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact, deterministic binary encoding. The default
/// for frame bodies and argument blobs.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// JSON codec: larger and slower, but inspectable as text. Used by
/// diagnostics tooling, never on the hot path.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}
