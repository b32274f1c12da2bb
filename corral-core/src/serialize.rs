//! # Serializer Seam
//!
//! Purpose: Decouple the engine from the payload encoding. The trait is
//! generic over the value type, so implementations stay allocation-light and
//! the engine carries the serializer as a type parameter rather than a trait
//! object.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BoxError;

/// Encodes and decodes cached values.
pub trait Serializer: Send + Sync {
    /// Encodes `value` into backend-storable bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, BoxError>;

    /// Decodes a payload produced by [`Serializer::encode`].
    ///
    /// May fail on corrupt or foreign payloads; the engine treats such
    /// failures as corruption, not as caller errors.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, BoxError>;
}

/// JSON serializer backed by `serde_json`; the default for the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, BoxError> {
        let raw = serde_json::to_vec(value)?;
        Ok(Bytes::from(raw))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, BoxError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_value() {
        let serializer = JsonSerializer;
        let encoded = serializer.encode(&"hello".to_string()).unwrap();
        let decoded: String = serializer.decode(&encoded).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn roundtrip_struct() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Payload {
            id: u64,
            name: String,
        }

        let serializer = JsonSerializer;
        let value = Payload {
            id: 7,
            name: "widget".to_string(),
        };
        let encoded = serializer.encode(&value).unwrap();
        let decoded: Payload = serializer.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let serializer = JsonSerializer;
        let result: Result<String, _> = serializer.decode(b"\xfe\xff not json");
        assert!(result.is_err());
    }
}
