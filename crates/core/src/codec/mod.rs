//! Payload codecs.
//!
//! The engine treats business payloads and timeout attributes as opaque
//! bytes at its edges; [`PayloadCodec`] is the seam where they are encoded.
//! [`JsonCodec`] is human-readable and good for debugging, [`BincodeCodec`]
//! is compact and fast.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON serialization/deserialization error")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization/deserialization error")]
    Bincode(#[from] bincode::Error),
}

/// Encode and decode values of `T` without fixing the wire format.
pub trait PayloadCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;

    /// Unique identifier for this codec.
    fn codec_id(&self) -> &'static str;
}

/// JSON payload codec.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Serialize + DeserializeOwned> PayloadCodec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Json)
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::Json)
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}

/// Compact binary payload codec.
#[derive(Debug, Default, Clone)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Serialize + DeserializeOwned> PayloadCodec<T> for BincodeCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(CodecError::Bincode)
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(data).map_err(CodecError::Bincode)
    }

    fn codec_id(&self) -> &'static str {
        "bincode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        amount_cents: u64,
        items: Vec<String>,
    }

    fn sample() -> Order {
        Order {
            id: "order-17".to_string(),
            amount_cents: 2499,
            items: vec!["widget".to_string(), "gizmo".to_string()],
        }
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec::new();
        let original = sample();

        let encoded = PayloadCodec::<Order>::encode(&codec, &original).unwrap();
        let decoded: Order = codec.decode(&encoded).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(PayloadCodec::<Order>::codec_id(&codec), "json");
    }

    #[test]
    fn test_bincode_codec_roundtrip() {
        let codec = BincodeCodec::new();
        let original = sample();

        let encoded = PayloadCodec::<Order>::encode(&codec, &original).unwrap();
        let decoded: Order = codec.decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_bincode_is_smaller_than_json() {
        let original = sample();
        let json = PayloadCodec::<Order>::encode(&JsonCodec::new(), &original).unwrap();
        let binary = PayloadCodec::<Order>::encode(&BincodeCodec::new(), &original).unwrap();
        assert!(
            binary.len() < json.len(),
            "bincode should be smaller: {} vs {}",
            binary.len(),
            json.len()
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec::new();
        let result: Result<Order, _> = codec.decode(b"not json at all");
        assert!(result.is_err());
    }
}
