//! # Keyed Lock Pool
//!
//! Purpose: Map cache keys to single-permit gates so recomputation for a key
//! happens at most once at a time, while keeping the map itself bounded under
//! arbitrary key cardinality.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Per-shard maps reduce contention on multi-core
//!    workloads; shard selection reuses one hash state.
//! 2. **RAII Handles**: Renting returns a handle whose drop gives the entry
//!    back and opportunistically evicts it.
//! 3. **Conditional Eviction**: An entry is removed only while the map still
//!    points at that very entry and its refcount is zero under the shard
//!    lock, so a racing rent can never lose its gate.
//! 4. **Coarse Sweeps**: A detached sweeper bounds worst-case memory after
//!    bursts of unique keys; it holds only a `Weak` so replaced pools clean
//!    themselves up.

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Shards = CPU count * multiplier, rounded to a power of two.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Floor for the sweeper period; sweeps are coarse to amortize the scan.
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// One key's coordination state: a single-permit gate plus bookkeeping for
/// eviction.
pub struct LockEntry {
    /// Single-permit gate serializing recomputation for the key.
    gate: Arc<Semaphore>,
    /// Number of outstanding rented handles.
    ref_count: AtomicUsize,
    /// Last rent time, in milliseconds since the pool's epoch.
    last_used_ms: AtomicU64,
}

impl LockEntry {
    fn new() -> Self {
        LockEntry {
            gate: Arc::new(Semaphore::new(1)),
            ref_count: AtomicUsize::new(0),
            last_used_ms: AtomicU64::new(0),
        }
    }

    fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }
}

struct Shard {
    entries: RwLock<HashMap<Arc<str>, Arc<LockEntry>, RandomState>>,
}

struct PoolInner {
    shards: Vec<Shard>,
    shard_mask: usize,
    hash_state: RandomState,
    window: Duration,
    epoch: Instant,
}

impl PoolInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    /// Gives a rented entry back; evicts it when it just became idle past the
    /// window and the map still holds this exact entry.
    fn release(&self, key: &str, entry: &Arc<LockEntry>) {
        let previous = entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "lock entry refcount underflow");
        if previous != 1 {
            return;
        }
        if entry.idle_for(self.now_ms()) < self.window {
            return;
        }

        let shard = self.shard_for(key);
        let mut entries = shard.entries.write();
        if let Some(current) = entries.get(key) {
            // Re-check the count under the shard lock: a rent that raced us
            // incremented it there, and removal would strand that renter.
            if Arc::ptr_eq(current, entry) && entry.ref_count.load(Ordering::Acquire) == 0 {
                entries.remove(key);
            }
        }
    }

    fn sweep(&self) -> usize {
        let now_ms = self.now_ms();
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.write();
            entries.retain(|_, entry| {
                let keep = entry.ref_count.load(Ordering::Acquire) != 0
                    || entry.idle_for(now_ms) < self.window;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }
}

/// Ref-counted, slidingly-evicted map from key to single-permit gate.
pub struct KeyedLockPool {
    inner: Arc<PoolInner>,
}

impl KeyedLockPool {
    /// Creates a pool whose unreferenced entries are evicted after sitting
    /// idle for `window`.
    pub fn new(window: Duration) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER), window)
    }

    /// Creates a pool with a caller-provided shard count, normalized to the
    /// next power of two for mask-based selection.
    pub fn with_shard_count(shards: usize, window: Duration) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Shard {
                entries: RwLock::new(HashMap::with_hasher(hash_state.clone())),
            });
        }

        KeyedLockPool {
            inner: Arc::new(PoolInner {
                shards: shard_vec,
                shard_mask: shard_count - 1,
                hash_state,
                window,
                epoch: Instant::now(),
            }),
        }
    }

    /// Finds or inserts the entry for `key`, increments its refcount, and
    /// touches its last-used time. Never fails.
    pub fn rent(&self, key: &str) -> RentedLock {
        let shard = self.inner.shard_for(key);
        let mut entries = shard.entries.write();
        let (key, entry) = match entries.get_key_value(key) {
            Some((existing_key, existing)) => (Arc::clone(existing_key), Arc::clone(existing)),
            None => {
                let key: Arc<str> = Arc::from(key);
                let entry = Arc::new(LockEntry::new());
                entries.insert(Arc::clone(&key), Arc::clone(&entry));
                (key, entry)
            }
        };
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        entry.last_used_ms.store(self.inner.now_ms(), Ordering::Relaxed);
        drop(entries);

        RentedLock {
            pool: Arc::clone(&self.inner),
            key,
            entry,
        }
    }

    /// Evicts every unreferenced entry idle past the window. Returns how
    /// many entries were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of entries currently mapped.
    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.entries.read().len())
            .sum()
    }

    /// Returns true when no entries are mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the detached sweeper task at period `max(window, 30s)`.
    ///
    /// The task holds only a `Weak` reference and exits on its own once the
    /// pool is dropped (for instance after a reconfigure swaps it out). Must
    /// be called within a Tokio runtime.
    pub fn spawn_sweeper(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.window.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        let removed = inner.sweep();
                        if removed > 0 {
                            trace!(removed, "lock pool sweep evicted idle entries");
                        }
                    }
                    None => break,
                }
            }
        });
    }
}

/// Handle to a rented lock entry; dropping it returns the entry to the pool.
pub struct RentedLock {
    pool: Arc<PoolInner>,
    key: Arc<str>,
    entry: Arc<LockEntry>,
}

impl RentedLock {
    /// Acquires the gate, waiting at most `timeout` (`None` waits
    /// indefinitely). Returns `None` when the gate was not acquired in time;
    /// dropping the returned permit releases the gate.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<OwnedSemaphorePermit> {
        let gate = Arc::clone(&self.entry.gate);
        match timeout {
            None => gate.acquire_owned().await.ok(),
            Some(wait) => match tokio::time::timeout(wait, gate.acquire_owned()).await {
                Ok(result) => result.ok(),
                Err(_) => None,
            },
        }
    }

    /// The key this handle was rented for.
    pub fn key(&self) -> &str {
        &self.key
    }

    #[cfg(test)]
    fn entry(&self) -> &Arc<LockEntry> {
        &self.entry
    }
}

impl Drop for RentedLock {
    fn drop(&mut self) {
        self.pool.release(&self.key, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_shares_one_entry_per_key() {
        let pool = KeyedLockPool::with_shard_count(4, Duration::from_secs(60));
        let first = pool.rent("alpha");
        let second = pool.rent("alpha");
        let other = pool.rent("beta");

        assert!(Arc::ptr_eq(first.entry(), second.entry()));
        assert!(!Arc::ptr_eq(first.entry(), other.entry()));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn return_evicts_entry_idle_past_window() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::ZERO);
        let rented = pool.rent("alpha");
        assert_eq!(pool.len(), 1);
        drop(rented);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn return_keeps_recently_used_entry() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::from_secs(60));
        drop(pool.rent("alpha"));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn sweep_evicts_idle_unreferenced_entries() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::from_millis(20));
        drop(pool.rent("alpha"));
        drop(pool.rent("beta"));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(pool.sweep(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn sweep_spares_held_entries() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::from_millis(10));
        let held = pool.rent("alpha");
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.len(), 1);
        drop(held);
    }

    #[test]
    fn outstanding_handle_keeps_mapping_alive() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::ZERO);
        let first = pool.rent("alpha");
        let second = pool.rent("alpha");
        drop(first);
        // The second handle kept the refcount above zero, so the mapping
        // must still be present for it.
        assert_eq!(pool.len(), 1);
        drop(second);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn gate_is_mutually_exclusive() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::from_secs(60));
        let rented = pool.rent("alpha");

        let permit = rented.acquire(None).await.expect("first acquire");
        assert!(rented
            .acquire(Some(Duration::from_millis(10)))
            .await
            .is_none());

        drop(permit);
        assert!(rented
            .acquire(Some(Duration::from_millis(10)))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn unbounded_acquire_waits_for_release() {
        let pool = Arc::new(KeyedLockPool::with_shard_count(2, Duration::from_secs(60)));
        let holder = pool.rent("alpha");
        let permit = holder.acquire(None).await.expect("acquire");

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let rented = waiter_pool.rent("alpha");
            rented.acquire(None).await.is_some()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn separate_keys_do_not_contend() {
        let pool = KeyedLockPool::with_shard_count(2, Duration::from_secs(60));
        let alpha = pool.rent("alpha");
        let beta = pool.rent("beta");

        let _alpha_permit = alpha.acquire(None).await.expect("alpha");
        assert!(beta
            .acquire(Some(Duration::from_millis(10)))
            .await
            .is_some());
    }
}
