//! # Backend Trait
//!
//! Purpose: Abstract the distributed cache the layer reads through. Any
//! byte-oriented store with get/set/remove fits behind this seam; the engine
//! never learns what transport or encoding sits underneath.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BoxError;
use crate::options::EntryOptions;

/// Byte-oriented distributed cache consumed by the engine.
///
/// Implementations report failures as opaque errors; the engine decides
/// whether a failure surfaces (foreground) or is swallowed (background
/// refresh). A missing key is `Ok(None)`, never an error.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetches the payload stored for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BoxError>;

    /// Stores `payload` under `key` with the given expiration options.
    async fn set(&self, key: &str, payload: Bytes, options: &EntryOptions) -> Result<(), BoxError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), BoxError>;
}
