//! # Read-Compute-Write Engine
//!
//! Purpose: Drive the lookup → serve-or-recompute protocol over an abstract
//! cache backend with at-most-one in-flight recomputation per key, optional
//! stale-while-revalidate, proactive early refresh, and bounded-wait
//! fallbacks.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Corral` hides the lock pool, envelope codec, and
//!    expiration planning behind a handful of `get_or_create` entry points.
//! 2. **No Locks Across Hit I/O**: The fast path is lookup + decode only;
//!    the per-key gate is held solely around double-check, compute, and
//!    store.
//! 3. **Atomic Reconfiguration**: Config and lock pool are published
//!    together behind an atomic pointer swap; in-flight calls keep the state
//!    they loaded.
//! 4. **Degrade, Don't Fail**: Corrupt payloads self-heal, gate timeouts
//!    fall back to stale serves or unstored computes, and background
//!    refreshes swallow their errors.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use corral_core::{
    decode_plain, encode_envelope, now_unix_millis, try_decode_envelope, BoxError, CacheBackend,
    CachePolicy, CorralConfig, CorralError, CorralResult, EffectivePolicy, EntryOptions,
    JsonSerializer, Metrics, MetricsSnapshot, Serializer,
};

use crate::lock_pool::KeyedLockPool;
use crate::planner::plan_store_options;

/// How long a background refresh waits for the gate before concluding a
/// peer is already refreshing the key.
const REFRESH_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Config plus the lock pool built for it; swapped as one unit.
struct EngineState {
    config: CorralConfig,
    pool: Arc<KeyedLockPool>,
}

fn build_state(config: CorralConfig) -> Arc<EngineState> {
    let pool = Arc::new(KeyedLockPool::new(config.key_lock_eviction_window));
    pool.spawn_sweeper();
    Arc::new(EngineState { config, pool })
}

/// Whether a store wraps the value in a soft-expiry envelope.
///
/// Policy-less calls write plain payloads for interoperability with
/// consumers that never opted into stale-while-revalidate.
#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Plain,
    Envelope,
}

/// Classification of a payload found in the backend.
enum Interpreted<T> {
    /// Envelope before its soft expiry.
    Fresh {
        value: T,
        soft_expire_ms: u64,
        hard_expire_ms: u64,
    },
    /// Envelope past soft but within hard expiry; serveable while a refresh
    /// runs.
    Stale { value: T, soft_expire_ms: u64 },
    /// Envelope past hard expiry; only usable by the fallback paths.
    Expired { value: T, hard_expire_ms: u64 },
    /// Payload written without an envelope.
    Plain { value: T },
    /// Neither decode could interpret the payload.
    Corrupt,
}

fn interpret<T, S>(
    serializer: &S,
    payload: &[u8],
    eff: &EffectivePolicy,
    now_ms: u64,
) -> Interpreted<T>
where
    T: DeserializeOwned,
    S: Serializer,
{
    if let Some(envelope) = try_decode_envelope::<T, S>(serializer, payload) {
        let soft = envelope.soft_expire_unix_ms;
        // The envelope only records the soft expiry; creation time and the
        // hard deadline are derived from the effective TTL pair.
        let created = soft.saturating_sub(eff.soft_ttl.as_millis() as u64);
        let hard = created.saturating_add(eff.hard_ttl.as_millis() as u64);
        return if now_ms <= soft {
            Interpreted::Fresh {
                value: envelope.value,
                soft_expire_ms: soft,
                hard_expire_ms: hard,
            }
        } else if now_ms <= hard {
            Interpreted::Stale {
                value: envelope.value,
                soft_expire_ms: soft,
            }
        } else {
            Interpreted::Expired {
                value: envelope.value,
                hard_expire_ms: hard,
            }
        };
    }

    match decode_plain::<T, S>(serializer, payload) {
        Ok(value) => Interpreted::Plain { value },
        Err(_) => Interpreted::Corrupt,
    }
}

/// Returns true when a hard-expired value may still be served by a fallback
/// path at `now_ms`.
fn stale_fallback_allowed(hard_expire_ms: u64, bound: Option<Duration>, now_ms: u64) -> bool {
    match bound {
        None => true,
        Some(max_stale) => {
            now_ms <= hard_expire_ms.saturating_add(max_stale.as_millis() as u64)
        }
    }
}

async fn run_compute<T, C, Fut>(metrics: &Metrics, compute: &C) -> CorralResult<T>
where
    C: Fn() -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let started = Instant::now();
    let result = compute().await;
    metrics.record_compute(started.elapsed());
    result.map_err(CorralError::Compute)
}

/// Applies the result filters and, when the value passes, encodes and stores
/// it. Returns whether a store happened.
async fn store_filtered<T, B, S>(
    backend: &B,
    serializer: &S,
    key: &str,
    value: &T,
    eff: &EffectivePolicy,
    caller_options: Option<&EntryOptions>,
    mode: WriteMode,
) -> CorralResult<bool>
where
    T: Serialize + Default + PartialEq,
    B: CacheBackend + ?Sized,
    S: Serializer,
{
    if eff.skip_caching_default && *value == T::default() {
        return Ok(false);
    }

    let payload = match mode {
        WriteMode::Envelope => {
            let soft = now_unix_millis().saturating_add(eff.soft_ttl.as_millis() as u64);
            encode_envelope(serializer, value, soft).map_err(CorralError::Serialize)?
        }
        WriteMode::Plain => serializer.encode(value).map_err(CorralError::Serialize)?,
    };

    if let Some(max_bytes) = eff.max_payload_bytes {
        if payload.len() > max_bytes {
            return Ok(false);
        }
    }

    let options = plan_store_options(caller_options, eff.hard_ttl, eff.jitter_fraction);
    backend
        .set(key, payload, &options)
        .await
        .map_err(|source| CorralError::backend("set", source))?;
    Ok(true)
}

/// Stampede-resistant read-through cache over an abstract backend.
///
/// All methods take `&self`; wrap the engine in an `Arc` to share it across
/// tasks. Constructors must run within a Tokio runtime because the lock
/// pool's sweeper is spawned eagerly.
pub struct Corral<B, S = JsonSerializer> {
    backend: Arc<B>,
    serializer: Arc<S>,
    state: ArcSwap<EngineState>,
    metrics: Arc<Metrics>,
}

impl<B> Corral<B>
where
    B: CacheBackend + 'static,
{
    /// Creates an engine over `backend` with default config and JSON
    /// serialization.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, CorralConfig::default())
    }

    /// Creates an engine with an explicit config and JSON serialization.
    pub fn with_config(backend: B, config: CorralConfig) -> Self {
        Self::with_serializer(backend, JsonSerializer, config)
    }
}

impl<B, S> Corral<B, S>
where
    B: CacheBackend + 'static,
    S: Serializer + Send + Sync + 'static,
{
    /// Creates an engine with an explicit serializer and config.
    pub fn with_serializer(backend: B, serializer: S, config: CorralConfig) -> Self {
        Corral {
            backend: Arc::new(backend),
            serializer: Arc::new(serializer),
            state: ArcSwap::from(build_state(config)),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Atomically replaces the config, rebuilding the lock pool.
    ///
    /// In-flight calls finish against the state they loaded; the old pool's
    /// sweeper terminates once those calls release their handles. Must be
    /// called within a Tokio runtime.
    pub fn configure(&self, mutate: impl FnOnce(&mut CorralConfig)) {
        let current = self.state.load();
        let mut config = current.config.clone();
        mutate(&mut config);
        self.state.store(build_state(config));
    }

    /// Returns a copy of the current config.
    pub fn config(&self) -> CorralConfig {
        self.state.load().config.clone()
    }

    /// Returns a point-in-time snapshot of the engine's metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Looks up `key`, computing and storing the value on a miss.
    ///
    /// Policy-less calls write plain payloads (no envelope) and never spawn
    /// background refreshes; reads accept envelope and plain payloads alike.
    pub async fn get_or_create<T, C, Fut>(&self, key: &str, compute: C) -> CorralResult<T>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.get_or_create_inner(key, None, None, Arc::clone(&self.serializer), Arc::new(compute))
            .await
    }

    /// Looks up `key` under `policy`, enabling envelope writes and
    /// stale-while-revalidate.
    pub async fn get_or_create_with<T, C, Fut>(
        &self,
        key: &str,
        policy: &CachePolicy,
        compute: C,
    ) -> CorralResult<T>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.get_or_create_inner(
            key,
            Some(policy),
            None,
            Arc::clone(&self.serializer),
            Arc::new(compute),
        )
        .await
    }

    /// Like [`Corral::get_or_create_with`], with caller-supplied backend
    /// entry options. The options are cloned before use; the caller's value
    /// is never mutated, and caller-supplied options are exempt from jitter.
    pub async fn get_or_create_with_options<T, C, Fut>(
        &self,
        key: &str,
        policy: &CachePolicy,
        options: &EntryOptions,
        compute: C,
    ) -> CorralResult<T>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.get_or_create_inner(
            key,
            Some(policy),
            Some(options.clone()),
            Arc::clone(&self.serializer),
            Arc::new(compute),
        )
        .await
    }

    /// Like [`Corral::get_or_create_with`], with a per-call serializer
    /// overriding the engine's.
    pub async fn get_or_create_with_serializer<T, C, Fut, S2>(
        &self,
        key: &str,
        policy: &CachePolicy,
        serializer: S2,
        compute: C,
    ) -> CorralResult<T>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
        S2: Serializer + Send + Sync + 'static,
    {
        self.get_or_create_inner(key, Some(policy), None, Arc::new(serializer), Arc::new(compute))
            .await
    }

    /// Removes the entry for `key` (prefix applied).
    pub async fn remove(&self, key: &str) -> CorralResult<()> {
        if key.trim().is_empty() {
            return Err(CorralError::EmptyKey);
        }
        let state = self.state.load_full();
        let effective_key = effective_key(&state.config, key);
        self.backend
            .remove(&effective_key)
            .await
            .map_err(|source| CorralError::backend("remove", source))
    }

    async fn get_or_create_inner<T, C, Fut, S2>(
        &self,
        key: &str,
        policy: Option<&CachePolicy>,
        caller_options: Option<EntryOptions>,
        serializer: Arc<S2>,
        compute: Arc<C>,
    ) -> CorralResult<T>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
        S2: Serializer + Send + Sync + 'static,
    {
        if key.trim().is_empty() {
            return Err(CorralError::EmptyKey);
        }

        let state = self.state.load_full();
        let eff = EffectivePolicy::resolve(policy, &state.config);
        let swr_enabled = policy.is_some();
        let mode = if swr_enabled {
            WriteMode::Envelope
        } else {
            WriteMode::Plain
        };
        let effective_key = effective_key(&state.config, key);

        // Last decodable payload seen, kept for the timeout and fail-safe
        // fallbacks.
        let mut fallback: Option<(T, u64)> = None;

        if let Some(payload) = self
            .backend
            .get(&effective_key)
            .await
            .map_err(|source| CorralError::backend("get", source))?
        {
            let now_ms = now_unix_millis();
            match interpret::<T, S2>(&serializer, &payload, &eff, now_ms) {
                Interpreted::Fresh {
                    value,
                    soft_expire_ms,
                    hard_expire_ms,
                } => {
                    self.metrics.record_hit();
                    let window_ms = eff.early_refresh_window.as_millis() as u64;
                    if swr_enabled
                        && window_ms > 0
                        && hard_expire_ms.saturating_sub(now_ms) <= window_ms
                    {
                        self.spawn_refresh(
                            Arc::clone(&state.pool),
                            effective_key,
                            eff,
                            caller_options,
                            soft_expire_ms,
                            serializer,
                            compute,
                        );
                    }
                    return Ok(value);
                }
                Interpreted::Plain { value } => {
                    self.metrics.record_hit();
                    return Ok(value);
                }
                Interpreted::Stale {
                    value,
                    soft_expire_ms,
                } => {
                    self.metrics.record_stale_served();
                    if swr_enabled {
                        self.spawn_refresh(
                            Arc::clone(&state.pool),
                            effective_key,
                            eff,
                            caller_options,
                            soft_expire_ms,
                            serializer,
                            compute,
                        );
                    }
                    return Ok(value);
                }
                Interpreted::Expired {
                    value,
                    hard_expire_ms,
                } => {
                    fallback = Some((value, hard_expire_ms));
                }
                Interpreted::Corrupt => {
                    self.metrics.record_deserialize_failure();
                    warn!(key = %effective_key, "removing undecodable cache payload");
                    self.backend
                        .remove(&effective_key)
                        .await
                        .map_err(|source| CorralError::backend("remove", source))?;
                }
            }
        }

        self.metrics.record_miss();
        let rented = state.pool.rent(&effective_key);
        let wait_started = Instant::now();
        let permit = rented.acquire(eff.lock_wait_timeout).await;
        self.metrics.record_lock_wait(wait_started.elapsed());

        let _permit = match permit {
            Some(permit) => permit,
            None => {
                // Bounded wait expired: serve the last-known payload when the
                // staleness bound allows, otherwise compute without storing
                // so the gate holder's write stays authoritative.
                if let Some((value, hard_expire_ms)) = fallback {
                    if stale_fallback_allowed(
                        hard_expire_ms,
                        eff.max_stale_on_failure,
                        now_unix_millis(),
                    ) {
                        self.metrics.record_stale_served();
                        return Ok(value);
                    }
                }
                return run_compute(&self.metrics, compute.as_ref()).await;
            }
        };

        // Double-check: a peer may have populated the entry while we waited.
        if let Some(payload) = self
            .backend
            .get(&effective_key)
            .await
            .map_err(|source| CorralError::backend("get", source))?
        {
            let now_ms = now_unix_millis();
            match interpret::<T, S2>(&serializer, &payload, &eff, now_ms) {
                Interpreted::Fresh { value, .. } | Interpreted::Plain { value } => {
                    self.metrics.record_hit();
                    return Ok(value);
                }
                Interpreted::Stale { value, .. } => {
                    self.metrics.record_stale_served();
                    return Ok(value);
                }
                Interpreted::Expired {
                    value,
                    hard_expire_ms,
                } => {
                    fallback = Some((value, hard_expire_ms));
                }
                Interpreted::Corrupt => {
                    self.metrics.record_deserialize_failure();
                    warn!(key = %effective_key, "removing undecodable cache payload");
                    self.backend
                        .remove(&effective_key)
                        .await
                        .map_err(|source| CorralError::backend("remove", source))?;
                }
            }
        }

        let value = match run_compute(&self.metrics, compute.as_ref()).await {
            Ok(value) => value,
            Err(err) => {
                // Fail-safe: when the caller bounded staleness explicitly, a
                // stale serve beats surfacing the failure.
                if eff.max_stale_on_failure.is_some() {
                    if let Some((value, hard_expire_ms)) = fallback {
                        if stale_fallback_allowed(
                            hard_expire_ms,
                            eff.max_stale_on_failure,
                            now_unix_millis(),
                        ) {
                            self.metrics.record_stale_served();
                            return Ok(value);
                        }
                    }
                }
                return Err(err);
            }
        };

        store_filtered(
            self.backend.as_ref(),
            serializer.as_ref(),
            &effective_key,
            &value,
            &eff,
            caller_options.as_ref(),
            mode,
        )
        .await?;
        Ok(value)
    }

    /// Fire-and-forget refresh on a detached task with its own context.
    ///
    /// `observed_soft_ms` is the soft expiry of the envelope that prompted
    /// the refresh; if the stored envelope no longer matches it, a peer got
    /// there first and the task exits without computing.
    #[allow(clippy::too_many_arguments)]
    fn spawn_refresh<T, C, Fut, S2>(
        &self,
        pool: Arc<KeyedLockPool>,
        key: String,
        eff: EffectivePolicy,
        caller_options: Option<EntryOptions>,
        observed_soft_ms: u64,
        serializer: Arc<S2>,
        compute: Arc<C>,
    ) where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
        S2: Serializer + Send + Sync + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let rented = pool.rent(&key);
            let Some(_permit) = rented.acquire(Some(REFRESH_ACQUIRE_TIMEOUT)).await else {
                // Someone else holds the gate; they are refreshing.
                return;
            };

            match backend.get(&key).await {
                Ok(Some(payload)) => {
                    if let Some(envelope) =
                        try_decode_envelope::<T, S2>(serializer.as_ref(), &payload)
                    {
                        if envelope.soft_expire_unix_ms != observed_soft_ms {
                            // Rewritten since we were spawned.
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(key = %key, error = %err, "background refresh lookup failed");
                    return;
                }
            }

            metrics.record_refresh_started();
            let value = match run_compute(&metrics, compute.as_ref()).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(key = %key, error = %err, "background refresh compute failed");
                    return;
                }
            };

            match store_filtered(
                backend.as_ref(),
                serializer.as_ref(),
                &key,
                &value,
                &eff,
                caller_options.as_ref(),
                WriteMode::Envelope,
            )
            .await
            {
                Ok(true) => metrics.record_refresh_completed(),
                Ok(false) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "background refresh store failed");
                }
            }
        });
    }
}

fn effective_key(config: &CorralConfig, key: &str) -> String {
    match config.effective_prefix() {
        Some(prefix) => format!("{prefix}{key}"),
        None => key.to_string(),
    }
}
