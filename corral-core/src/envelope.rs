//! # Envelope Codec
//!
//! Purpose: Wrap cached values with the soft-expiry metadata that drives
//! stale-while-revalidate decisions, while staying readable next to plain
//! payloads written before the wrapping was adopted.
//!
//! ## Design Principles
//! 1. **Tagged Wire Form**: A version byte under a reserved field name plus
//!    `deny_unknown_fields` lets envelope decode fail cleanly on anything
//!    that is not an envelope, so the dual-read fallback is unambiguous.
//! 2. **Serializer-Defined Bytes**: The codec only fixes the struct shape;
//!    the byte layout belongs to whichever [`Serializer`] is in use.
//! 3. **Swallowed Misses**: `try_decode_envelope` never errors — a payload
//!    that is not an envelope is simply a miss for this codec.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::serialize::Serializer;

/// Wire tag identifying envelope payloads.
const ENVELOPE_TAG: u8 = 1;

/// A cached value together with its soft-expiry instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// The wrapped value, returned to callers untouched.
    pub value: T,
    /// Wall-clock soft expiry in milliseconds since the Unix epoch.
    pub soft_expire_unix_ms: u64,
}

/// Serialized form of [`Envelope`].
///
/// `deny_unknown_fields` plus the tag keep a plain payload from ever
/// decoding as an envelope by accident.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvelopeWire<T> {
    #[serde(rename = "__swr")]
    tag: u8,
    soft_expire_ms: u64,
    value: T,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Encodes `value` wrapped in an envelope carrying its soft expiry.
pub fn encode_envelope<T, S>(
    serializer: &S,
    value: &T,
    soft_expire_unix_ms: u64,
) -> Result<Bytes, BoxError>
where
    T: Serialize,
    S: Serializer,
{
    serializer.encode(&EnvelopeWire {
        tag: ENVELOPE_TAG,
        soft_expire_ms: soft_expire_unix_ms,
        value,
    })
}

/// Attempts to decode `payload` as an envelope.
///
/// Returns `None` when the payload is not an envelope (decode error or tag
/// mismatch); the caller then falls back to a plain decode.
pub fn try_decode_envelope<T, S>(serializer: &S, payload: &[u8]) -> Option<Envelope<T>>
where
    T: DeserializeOwned,
    S: Serializer,
{
    let wire: EnvelopeWire<T> = serializer.decode(payload).ok()?;
    if wire.tag != ENVELOPE_TAG {
        return None;
    }
    Some(Envelope {
        value: wire.value,
        soft_expire_unix_ms: wire.soft_expire_ms,
    })
}

/// Decodes `payload` as a bare value, for entries written without envelopes.
pub fn decode_plain<T, S>(serializer: &S, payload: &[u8]) -> Result<T, BoxError>
where
    T: DeserializeOwned,
    S: Serializer,
{
    serializer.decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::JsonSerializer;

    #[test]
    fn envelope_roundtrip() {
        let serializer = JsonSerializer;
        let encoded = encode_envelope(&serializer, &"data".to_string(), 1_234).unwrap();
        let envelope: Envelope<String> = try_decode_envelope(&serializer, &encoded).unwrap();
        assert_eq!(envelope.value, "data");
        assert_eq!(envelope.soft_expire_unix_ms, 1_234);
    }

    #[test]
    fn plain_payload_is_an_envelope_miss() {
        let serializer = JsonSerializer;
        let plain = serializer.encode(&"data".to_string()).unwrap();
        assert!(try_decode_envelope::<String, _>(&serializer, &plain).is_none());

        let decoded: String = decode_plain(&serializer, &plain).unwrap();
        assert_eq!(decoded, "data");
    }

    #[test]
    fn envelope_like_object_without_tag_is_a_miss() {
        let serializer = JsonSerializer;
        let impostor = br#"{"soft_expire_ms":5,"value":"x"}"#;
        assert!(try_decode_envelope::<String, _>(&serializer, impostor).is_none());
    }

    #[test]
    fn garbage_is_a_miss_for_both_decoders() {
        let serializer = JsonSerializer;
        let garbage = b"\xde\xad\xbe\xef";
        assert!(try_decode_envelope::<String, _>(&serializer, garbage).is_none());
        assert!(decode_plain::<String, _>(&serializer, garbage).is_err());
    }

    #[test]
    fn decode_never_mutates_the_value() {
        let serializer = JsonSerializer;
        let value = vec![1u32, 2, 3];
        let encoded = encode_envelope(&serializer, &value, 99).unwrap();
        let envelope: Envelope<Vec<u32>> = try_decode_envelope(&serializer, &encoded).unwrap();
        assert_eq!(envelope.value, value);
    }
}
