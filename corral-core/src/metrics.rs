//! # Cache Metrics
//!
//! Purpose: Provide lightweight counters and latency histograms so hit
//! rates, stale serves, refresh activity, and gate/compute latency can be
//! observed without an external metrics dependency.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array for
//!    cache locality.
//! 3. **Zero-Cost Access**: Snapshots are plain structs without heap work
//!    beyond the bucket vector.
//!
//! ## Notes
//! - Recording is always on; a relaxed atomic increment is cheap enough that
//!   no separate noop sink is needed.
//! - Bucket boundaries are expressed in microseconds and can be tuned later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] = [
    50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 500_000,
];

/// Snapshot of all cache metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Fresh (or plain) payloads served straight from the backend.
    pub hits: u64,
    /// Calls that entered the lock/compute path.
    pub misses: u64,
    /// Stale payloads served while a refresh ran or a fallback applied.
    pub stale_served: u64,
    /// Background refreshes that acquired the gate and began work.
    pub refresh_started: u64,
    /// Background refreshes that stored a new payload.
    pub refresh_completed: u64,
    /// Payloads dropped because neither decode interpreted them.
    pub deserialize_failures: u64,
    /// Gate wait latency histogram.
    pub lock_wait: LatencySnapshot,
    /// Compute invocation latency histogram.
    pub compute: LatencySnapshot,
}

/// Snapshot of one latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

/// Thread-safe metrics aggregator for the caching layer.
///
/// All counters use `Ordering::Relaxed`; nothing here requires cross-field
/// ordering, only eventual consistency.
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    refresh_started: AtomicU64,
    refresh_completed: AtomicU64,
    deserialize_failures: AtomicU64,
    lock_wait: LatencyHistogram,
    compute: LatencyHistogram,
}

impl Metrics {
    /// Creates an aggregator with the default latency buckets.
    pub fn new() -> Self {
        Metrics {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
            refresh_started: AtomicU64::new(0),
            refresh_completed: AtomicU64::new(0),
            deserialize_failures: AtomicU64::new(0),
            lock_wait: LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec()),
            compute: LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec()),
        }
    }

    /// Records a payload served fresh from the backend.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a call entering the lock/compute path.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a stale payload handed to a caller.
    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a background refresh beginning work.
    pub fn record_refresh_started(&self) {
        self.refresh_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a background refresh storing its result.
    pub fn record_refresh_completed(&self) {
        self.refresh_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a payload neither decode could interpret.
    pub fn record_deserialize_failure(&self) {
        self.deserialize_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long a caller waited on the per-key gate.
    pub fn record_lock_wait(&self, waited: Duration) {
        self.lock_wait.record(waited);
    }

    /// Records one compute invocation's latency.
    pub fn record_compute(&self, elapsed: Duration) {
        self.compute.record(elapsed);
    }

    /// Returns a point-in-time snapshot of all counters and histograms.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            refresh_started: self.refresh_started.load(Ordering::Relaxed),
            refresh_completed: self.refresh_completed.load(Ordering::Relaxed),
            deserialize_failures: self.deserialize_failures.load(Ordering::Relaxed),
            lock_wait: self.lock_wait.snapshot(),
            compute: self.compute.snapshot(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a linear scan; the bucket list is short and stays hot
/// in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds,
    /// sorted ascending). One extra overflow bucket is appended.
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let mut buckets = Vec::with_capacity(bounds_us.len() + 1);
        for _ in 0..=bounds_us.len() {
            buckets.push(AtomicU64::new(0));
        }
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records one latency measurement.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
