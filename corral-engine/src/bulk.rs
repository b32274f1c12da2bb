//! # Bulk Fan-Out
//!
//! Purpose: Run get-or-create over a vector of keys with bounded
//! concurrency, preserving input order in the results. Each key delegates to
//! the single-key engine, so per-key single-flight and SWR behavior are
//! unchanged.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use corral_core::{BoxError, CacheBackend, CachePolicy, CorralResult, Serializer};

use crate::engine::Corral;

impl<B, S> Corral<B, S>
where
    B: CacheBackend + 'static,
    S: Serializer + Send + Sync + 'static,
{
    /// Runs [`Corral::get_or_create`] for every key, at most
    /// `max_concurrency` in flight (defaulting to the CPU count), returning
    /// values in input order.
    ///
    /// The first failure is propagated and in-flight peers are dropped.
    /// Empty input returns an empty vector without touching the backend.
    pub async fn get_or_create_many<T, C, Fut>(
        &self,
        keys: &[String],
        compute_per_key: C,
        max_concurrency: Option<usize>,
    ) -> CorralResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.many_inner(keys, None, compute_per_key, max_concurrency)
            .await
    }

    /// Like [`Corral::get_or_create_many`], with a policy applied to every
    /// key.
    pub async fn get_or_create_many_with<T, C, Fut>(
        &self,
        keys: &[String],
        policy: &CachePolicy,
        compute_per_key: C,
        max_concurrency: Option<usize>,
    ) -> CorralResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.many_inner(keys, Some(policy), compute_per_key, max_concurrency)
            .await
    }

    async fn many_inner<T, C, Fut>(
        &self,
        keys: &[String],
        policy: Option<&CachePolicy>,
        compute_per_key: C,
        max_concurrency: Option<usize>,
    ) -> CorralResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq + Send + Sync + 'static,
        C: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let degree = effective_degree(keys.len(), max_concurrency);
        let compute = Arc::new(compute_per_key);

        let calls = keys.iter().map(|key| {
            let compute = Arc::clone(&compute);
            let key = key.clone();
            async move {
                let per_key = {
                    let compute = Arc::clone(&compute);
                    let key = key.clone();
                    move || (*compute)(key.clone())
                };
                match policy {
                    Some(policy) => self.get_or_create_with(&key, policy, per_key).await,
                    None => self.get_or_create(&key, per_key).await,
                }
            }
        });

        stream::iter(calls).buffered(degree).try_collect().await
    }
}

/// Effective parallelism: `max(1, min(len, requested ?? CPU count))`.
fn effective_degree(len: usize, max_concurrency: Option<usize>) -> usize {
    let requested = max_concurrency.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    });
    requested.min(len).max(1)
}
