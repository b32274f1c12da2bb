//! # In-Memory Backend
//!
//! Purpose: Provide a process-local implementation of the cache backend
//! trait, mainly for tests, benchmarks, and single-node deployments. Honors
//! the full set of entry options: absolute deadlines, deadlines relative to
//! the write, and sliding windows renewed on read.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Per-shard maps reduce contention under concurrent
//!    callers; shard selection reuses one hash state.
//! 2. **Lazy Expiry**: Expiration is checked on access so reads stay O(1);
//!    `purge_expired` exists for callers that want active cleanup.
//! 3. **Cheap Payloads**: Values are `Bytes`, so returning a payload is a
//!    refcount bump rather than a copy.

use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, Instant, SystemTime};

use ahash::RandomState;
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

use corral_core::{BoxError, CacheBackend, EntryOptions};

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

struct StoredEntry {
    payload: Bytes,
    /// Absolute deadline; `None` means no expiration.
    deadline: Option<Instant>,
    /// Idle window; reads push the deadline out by this much.
    sliding: Option<Duration>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }
}

struct Shard {
    entries: RwLock<HashMap<String, StoredEntry, RandomState>>,
}

/// Sharded in-memory implementation of [`CacheBackend`].
pub struct MemoryBackend {
    shards: Vec<Shard>,
    shard_mask: usize,
    hash_state: RandomState,
}

impl MemoryBackend {
    /// Creates a backend with a shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a backend with a caller-provided shard count, normalized to
    /// the next power of two for mask-based selection.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                entries: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            });
        }

        MemoryBackend {
            shards: shard_vec,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .entries
                    .read()
                    .values()
                    .filter(|entry| !entry.is_expired(now))
                    .count()
            })
            .sum()
    }

    /// Returns true when no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when a live entry exists for `key`, without renewing a
    /// sliding window.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shard_for(key)
            .entries
            .read()
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Removes expired entries across all shards; returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.write();
            entries.retain(|_, entry| {
                let keep = !entry.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }

    /// Resolves entry options into a concrete deadline at write time.
    ///
    /// When several fields are set the earliest deadline wins.
    fn deadline_for(options: &EntryOptions, now: Instant) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |candidate: Instant| {
            deadline = Some(match deadline {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        if let Some(at) = options.absolute_expiration {
            // A deadline already in the past collapses to "expired now".
            let remaining = at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            consider(now + remaining);
        }
        if let Some(ttl) = options.absolute_expiration_relative_to_now {
            consider(now + ttl);
        }
        if let Some(window) = options.sliding_expiration {
            consider(now + window);
        }
        deadline
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BoxError> {
        let now = Instant::now();
        let shard = self.shard_for(key);
        let mut entries = shard.entries.write();

        let expired = match entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }

        let entry = entries.get_mut(key).expect("entry checked above");
        if let Some(window) = entry.sliding {
            entry.deadline = Some(now + window);
        }
        Ok(Some(entry.payload.clone()))
    }

    async fn set(
        &self,
        key: &str,
        payload: Bytes,
        options: &EntryOptions,
    ) -> Result<(), BoxError> {
        let now = Instant::now();
        let entry = StoredEntry {
            payload,
            deadline: Self::deadline_for(options, now),
            sliding: options.sliding_expiration,
        };
        self.shard_for(key)
            .entries
            .write()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        self.shard_for(key).entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let backend = MemoryBackend::with_shard_count(4);
        backend
            .set("alpha", Bytes::from_static(b"value"), &EntryOptions::default())
            .await
            .unwrap();

        let payload = backend.get("alpha").await.unwrap().unwrap();
        assert_eq!(&payload[..], b"value");
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let backend = MemoryBackend::with_shard_count(2);
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relative_expiration_hides_value() {
        let backend = MemoryBackend::with_shard_count(2);
        backend
            .set(
                "alpha",
                Bytes::from_static(b"value"),
                &EntryOptions::relative(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        assert!(backend.get("alpha").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.get("alpha").await.unwrap().is_none());
        assert!(!backend.contains("alpha"));
    }

    #[tokio::test]
    async fn absolute_expiration_in_the_past_expires_immediately() {
        let backend = MemoryBackend::with_shard_count(2);
        backend
            .set(
                "alpha",
                Bytes::from_static(b"value"),
                &EntryOptions::absolute(SystemTime::now() - Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(backend.get("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sliding_window_renews_on_read() {
        let backend = MemoryBackend::with_shard_count(2);
        backend
            .set(
                "alpha",
                Bytes::from_static(b"value"),
                &EntryOptions::sliding(Duration::from_millis(40)),
            )
            .await
            .unwrap();

        // Each read inside the window pushes the deadline out again.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(backend.get("alpha").await.unwrap().is_some());
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(backend.get("alpha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let backend = MemoryBackend::with_shard_count(2);
        backend
            .set("alpha", Bytes::from_static(b"value"), &EntryOptions::default())
            .await
            .unwrap();

        backend.remove("alpha").await.unwrap();
        assert!(backend.get("alpha").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn purge_expired_removes_entries() {
        let backend = MemoryBackend::with_shard_count(2);
        backend
            .set(
                "alpha",
                Bytes::from_static(b"value"),
                &EntryOptions::relative(Duration::from_millis(5)),
            )
            .await
            .unwrap();
        backend
            .set("beta", Bytes::from_static(b"value"), &EntryOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
    }
}
