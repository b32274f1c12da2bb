// corral-core - Shared types for the Corral caching layer
//
// This crate defines the seams the engine coordinates across: the backend
// and serializer traits, the envelope codec, expiration options, policy and
// configuration, and the metrics accumulator.

pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod options;
pub mod serialize;

// Re-export for convenience
pub use backend::CacheBackend;
pub use config::{CachePolicy, CorralConfig, EffectivePolicy, MAX_JITTER_FRACTION};
pub use envelope::{
    decode_plain, encode_envelope, now_unix_millis, try_decode_envelope, Envelope,
};
pub use error::{BoxError, CorralError, CorralResult};
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot};
pub use options::EntryOptions;
pub use serialize::{JsonSerializer, Serializer};
