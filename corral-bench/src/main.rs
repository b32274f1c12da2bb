//! # Stampede Benchmark Harness
//!
//! Purpose: Provide a repeatable benchmark driver for the coordination
//! engine so baseline throughput and coordination overhead can be compared
//! over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: A fixed PRNG seed per task keeps key
//!    selection stable across runs.
//! 2. **Allocation Control**: Keys are pre-built so formatting stays off the
//!    hot path.
//! 3. **Honest Contention**: Tasks share one engine and a bounded key
//!    universe, so single-flight coordination is actually exercised.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use corral_core::{CachePolicy, CorralConfig};
use corral_engine::Corral;
use corral_memory::MemoryBackend;

const DEFAULT_TASK_COUNT: usize = 8;
const DEFAULT_OPS_PER_TASK: usize = 50_000;
const DEFAULT_KEY_COUNT: usize = 1 << 10;

struct BenchConfig {
    task_count: usize,
    ops_per_task: usize,
    key_count: usize,
    key_mask: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let task_count = parse_usize(args.next(), DEFAULT_TASK_COUNT).max(1);
        let ops_per_task = parse_usize(args.next(), DEFAULT_OPS_PER_TASK).max(1);
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let key_count = requested_keys.max(1).next_power_of_two();

        BenchConfig {
            task_count,
            ops_per_task,
            key_count,
            key_mask: key_count - 1,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the workload reproducible without pulling
/// randomness into the measured loop.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        XorShift64 {
            state: seed.max(1),
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bench = BenchConfig::from_args();
    println!(
        "stampede bench: {} tasks x {} ops over {} keys",
        bench.task_count, bench.ops_per_task, bench.key_count
    );

    let config = CorralConfig {
        default_hard_ttl: Duration::from_secs(5),
        default_soft_ttl: Duration::from_secs(1),
        expiration_jitter_fraction: 0.1,
        ..CorralConfig::default()
    };
    let engine = Arc::new(Corral::with_config(MemoryBackend::new(), config));
    let policy = CachePolicy::default();

    let keys: Arc<Vec<String>> = Arc::new(
        (0..bench.key_count)
            .map(|index| format!("bench-key-{index}"))
            .collect(),
    );
    let compute_calls = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(bench.task_count);
    for task_id in 0..bench.task_count {
        let engine = Arc::clone(&engine);
        let keys = Arc::clone(&keys);
        let policy = policy.clone();
        let compute_calls = Arc::clone(&compute_calls);
        let ops = bench.ops_per_task;
        let mask = bench.key_mask;

        tasks.push(tokio::spawn(async move {
            let mut rng = XorShift64::new(0x9E37_79B9 ^ (task_id as u64 + 1));
            for _ in 0..ops {
                let key = &keys[(rng.next() as usize) & mask];
                let calls = Arc::clone(&compute_calls);
                let value = key.clone();
                engine
                    .get_or_create_with(key, &policy, move || {
                        let calls = Arc::clone(&calls);
                        let value = value.clone();
                        async move {
                            calls.fetch_add(1, Ordering::Relaxed);
                            Ok(format!("value-for-{value}"))
                        }
                    })
                    .await?;
            }
            Ok::<(), anyhow::Error>(())
        }));
    }

    for task in tasks {
        task.await??;
    }
    let elapsed = started.elapsed();

    let total_ops = bench.task_count * bench.ops_per_task;
    let throughput = total_ops as f64 / elapsed.as_secs_f64();
    println!(
        "completed {} ops in {:.2?} ({:.0} ops/sec)",
        total_ops, elapsed, throughput
    );
    println!(
        "compute invocations: {} ({:.2}% of ops)",
        compute_calls.load(Ordering::Relaxed),
        100.0 * compute_calls.load(Ordering::Relaxed) as f64 / total_ops as f64
    );

    let snapshot = engine.metrics();
    println!(
        "hits={} misses={} stale_served={} refresh_started={} refresh_completed={}",
        snapshot.hits,
        snapshot.misses,
        snapshot.stale_served,
        snapshot.refresh_started,
        snapshot.refresh_completed
    );
    if snapshot.lock_wait.samples > 0 {
        println!(
            "lock wait: {} samples, avg {}us",
            snapshot.lock_wait.samples,
            snapshot.lock_wait.sum_us / snapshot.lock_wait.samples
        );
    }
    if snapshot.compute.samples > 0 {
        println!(
            "compute: {} samples, avg {}us",
            snapshot.compute.samples,
            snapshot.compute.sum_us / snapshot.compute.samples
        );
    }

    Ok(())
}
