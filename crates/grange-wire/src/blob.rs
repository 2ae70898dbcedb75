use grange_core::ErrorCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Codec, PostcardCodec};

/// Encodes a method argument tuple (or result value) into a blob.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    PostcardCodec::encode(value)
}

/// Decodes a blob back into an argument tuple (or result value).
pub fn decode_value<T: DeserializeOwned>(blob: &[u8]) -> Result<T, postcard::Error> {
    PostcardCodec::decode(blob)
}

/// Structured failure carried in non-`Ok` response payloads, so clients
/// can reconstruct a meaningful error rather than parse free text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorPayload {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // An ErrorPayload always serializes: an enum and a string.
        PostcardCodec::encode(self).unwrap_or_default()
    }

    /// Decodes an error payload, falling back to `Internal` when the blob
    /// itself is damaged; a broken error must still surface as an error.
    pub fn decode(blob: &[u8]) -> Self {
        PostcardCodec::decode(blob).unwrap_or_else(|_| {
            ErrorPayload::new(ErrorCode::Internal, "undecodable error payload")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let args = ("hi".to_string(), 7u32);
        let blob = encode_value(&args).unwrap();
        let back: (String, u32) = decode_value(&blob).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn unit_value_roundtrip() {
        let blob = encode_value(&()).unwrap();
        decode_value::<()>(&blob).unwrap();
    }

    #[test]
    fn error_payload_roundtrip() {
        let payload = ErrorPayload::new(ErrorCode::Denied, "role below Admin");
        let back = ErrorPayload::decode(&payload.encode());
        assert_eq!(back, payload);
    }

    #[test]
    fn damaged_error_payload_degrades_to_internal() {
        let back = ErrorPayload::decode(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(back.code, ErrorCode::Internal);
    }

    #[test]
    fn wrong_type_fails_cleanly() {
        let blob = encode_value(&("text",)).unwrap();
        assert!(decode_value::<(u64, u64)>(&blob).is_err());
    }
}
