//! # Error Types
//!
//! Purpose: Define the error surface shared by the Corral crates, keeping
//! underlying causes attached so callers can log or match on them.

use thiserror::Error;

/// Boxed opaque cause used at the backend / serializer / compute seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for the caching layer.
pub type CorralResult<T> = Result<T, CorralError>;

/// Errors surfaced by the caching layer.
///
/// Lock-wait timeouts are intentionally absent: a timed-out gate acquisition
/// degrades to the fallback path instead of failing the call. Decode failures
/// on a cache hit are likewise self-healing (the entry is removed and
/// recomputed) and never reach the caller.
#[derive(Debug, Error)]
pub enum CorralError {
    /// The cache key was empty or whitespace-only.
    #[error("cache key must not be empty")]
    EmptyKey,

    /// Encoding a value for storage failed.
    #[error("serialize failed")]
    Serialize(#[source] BoxError),

    /// Decoding a payload failed where the caller asked for a strict decode.
    #[error("deserialize failed")]
    Deserialize(#[source] BoxError),

    /// A backend operation failed on the foreground path.
    #[error("cache backend {op} failed")]
    Backend {
        /// Backend operation that failed ("get", "set", or "remove").
        op: &'static str,
        #[source]
        source: BoxError,
    },

    /// The caller-supplied compute function failed.
    #[error("compute failed")]
    Compute(#[source] BoxError),
}

impl CorralError {
    /// Wraps a backend failure with the operation that produced it.
    pub fn backend(op: &'static str, source: BoxError) -> Self {
        CorralError::Backend { op, source }
    }
}
