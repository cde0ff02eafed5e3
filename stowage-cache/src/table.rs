//! Read/write-through table cache.
//!
//! This module coordinates a [`CacheBackend`] with a caller-supplied origin
//! (usually a database table) described by [`TableContent`]:
//!
//! - Single reads fall back to the origin on a miss, with concurrent loads
//!   for the same key coalesced through a [`SingleFlight`] registry
//! - Origin misses can be negative-cached with the backend's empty marker so
//!   repeated lookups for absent rows never reach the origin
//! - Batch reads fetch only the keys the backend has never seen, in one
//!   origin call
//!
//! Writing a loaded value back to the backend is best-effort: failures are
//! logged and never fail the read that triggered them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stowage_core::{CacheError, CacheResult, TableConfig};

use crate::backend::{require_non_empty, CacheBackend};
use crate::single_flight::SingleFlight;

/// Describes how to key and load one origin table.
///
/// `T` is the caller's identifier type (a row id, a composite key struct).
/// The same `T` must always map to the same cache key.
#[async_trait]
pub trait TableContent<T>: Send + Sync
where
    T: Eq + Hash + Clone + Send + Sync,
{
    /// Logical cache key for `param`, e.g. `user:42`.
    fn get_key(&self, param: &T) -> String;

    /// Load one value from the origin. Report a missing row as
    /// `CacheError::NotFound`.
    async fn get_value(&self, param: &T) -> CacheResult<String>;

    /// Load many values from the origin. Missing rows are left out of the
    /// map.
    async fn get_value_map(&self, params: &[T]) -> CacheResult<HashMap<T, String>>;

    /// Whether origin misses should be negative-cached.
    fn is_prevent_penetration(&self) -> bool {
        false
    }
}

/// Cache-aside coordinator over one backend.
///
/// Cloning is cheap and clones share the backend and the coalescing
/// registry.
///
/// # Example
///
/// ```ignore
/// let backend = Arc::new(RedisCache::connect(&config.redis, &config.backend).await?);
/// let users = TableCache::from_config(backend, &config.table);
///
/// let name = users.get(&UserTable { db }, &42).await?;
/// ```
pub struct TableCache<B: ?Sized> {
    backend: Arc<B>,
    flight: Arc<SingleFlight<String, String>>,
    expire: Duration,
}

impl<B: ?Sized> Clone for TableCache<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            flight: Arc::clone(&self.flight),
            expire: self.expire,
        }
    }
}

impl<B> TableCache<B>
where
    B: CacheBackend + ?Sized,
{
    /// Create a table cache with its own coalescing registry. An
    /// `expire_secs` of 0 stores entries without expiry.
    pub fn new(backend: Arc<B>, expire_secs: u64) -> Self {
        Self::with_single_flight(backend, Arc::new(SingleFlight::new()), expire_secs)
    }

    /// Create a table cache that coalesces through a shared registry.
    pub fn with_single_flight(
        backend: Arc<B>,
        flight: Arc<SingleFlight<String, String>>,
        expire_secs: u64,
    ) -> Self {
        Self {
            backend,
            flight,
            expire: Duration::from_secs(expire_secs),
        }
    }

    /// Table cache with the expiry from `config`.
    pub fn from_config(backend: Arc<B>, config: &TableConfig) -> Self {
        Self::new(backend, config.expire_secs)
    }

    /// The backend this table reads and writes.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// TTL applied to every value and marker written.
    pub fn expire(&self) -> Duration {
        self.expire
    }

    /// The coalescing group shared by this table's loads.
    pub fn single_flight(&self) -> &SingleFlight<String, String> {
        &self.flight
    }

    /// Read one value, loading it from the origin on a miss.
    ///
    /// A negative-cached key fails with `NotFound` without touching the
    /// origin. Backend failures other than a miss are returned as-is.
    pub async fn get<T, C>(&self, content: &C, param: &T) -> CacheResult<String>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        let key = content.get_key(param);

        let value = match self.backend.get(&key).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %key, "cache miss, loading from origin");
                self.flight
                    .work(&key, self.load(content, param, &key))
                    .await?
            }
            Err(e) => return Err(e),
        };

        if self.backend.is_empty(&value) {
            return Err(CacheError::not_found(
                "deleted or does not exist, please check your parameters",
            ));
        }
        Ok(value)
    }

    /// Load `param` from the origin and write it back to the backend.
    pub async fn set<T, C>(&self, content: &C, param: &T) -> CacheResult<()>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        let key = content.get_key(param);
        match content.get_value(param).await {
            Ok(value) => self.backend.set(&key, &value, self.expire).await,
            Err(e) => {
                if e.is_not_found() && content.is_prevent_penetration() {
                    self.populate("set empty marker", self.backend.set_empty(&key, self.expire))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Read many values, loading only the keys the backend has no entry
    /// for.
    ///
    /// Negative-cached keys are left out of the result and are not sent to
    /// the origin.
    pub async fn mget<T, C>(&self, content: &C, params: &[T]) -> CacheResult<HashMap<T, String>>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        require_non_empty(params.len())?;

        let mut reverse: HashMap<String, T> = HashMap::with_capacity(params.len());
        let mut keys = Vec::with_capacity(params.len());
        for param in params {
            let key = content.get_key(param);
            if let Entry::Vacant(vacant) = reverse.entry(key.clone()) {
                vacant.insert(param.clone());
                keys.push(key);
            }
        }

        let cached = self.backend.mget(&keys).await?;

        let mut result = HashMap::with_capacity(keys.len());
        for (key, value) in &cached {
            if self.backend.is_empty(value) {
                continue;
            }
            if let Some(param) = reverse.get(key) {
                result.insert(param.clone(), value.clone());
            }
        }

        if cached.len() >= keys.len() {
            return Ok(result);
        }

        let missing: Vec<T> = keys
            .iter()
            .filter(|key| !cached.contains_key(*key))
            .filter_map(|key| reverse.get(key).cloned())
            .collect();
        tracing::debug!(
            requested = keys.len(),
            missing = missing.len(),
            "batch cache miss, loading from origin"
        );

        let loaded = content.get_value_map(&missing).await?;

        if content.is_prevent_penetration() && loaded.len() < missing.len() {
            let absent: Vec<String> = missing
                .iter()
                .filter(|param| !loaded.contains_key(*param))
                .map(|param| content.get_key(param))
                .collect();
            if !absent.is_empty() {
                self.populate(
                    "batch set empty markers",
                    self.backend.mset_empty(&absent, self.expire),
                )
                .await;
            }
        }

        if !loaded.is_empty() {
            let data: HashMap<String, String> = loaded
                .iter()
                .map(|(param, value)| (content.get_key(param), value.clone()))
                .collect();
            self.populate("batch set values", self.backend.mset(&data, self.expire))
                .await;
        }

        result.extend(loaded);
        Ok(result)
    }

    /// Load every param from the origin and write them in one batch.
    pub async fn mset<T, C>(&self, content: &C, params: &[T]) -> CacheResult<()>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        require_non_empty(params.len())?;

        let loaded = content.get_value_map(params).await?;
        let data: HashMap<String, String> = loaded
            .into_iter()
            .map(|(param, value)| (content.get_key(&param), value))
            .collect();
        self.backend.mset(&data, self.expire).await
    }

    /// Drop the cached entries for `params`.
    pub async fn del<T, C>(&self, content: &C, params: &[T]) -> CacheResult<()>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        require_non_empty(params.len())?;

        let keys: Vec<String> = params.iter().map(|param| content.get_key(param)).collect();
        self.backend.mdel(&keys).await
    }

    /// Body of a coalesced single-key load.
    async fn load<T, C>(&self, content: &C, param: &T, key: &str) -> CacheResult<String>
    where
        T: Eq + Hash + Clone + Send + Sync,
        C: TableContent<T> + ?Sized,
    {
        match content.get_value(param).await {
            Ok(value) => {
                self.populate("set value", self.backend.set(key, &value, self.expire))
                    .await;
                Ok(value)
            }
            Err(e) => {
                if e.is_not_found() && content.is_prevent_penetration() {
                    self.populate("set empty marker", self.backend.set_empty(key, self.expire))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Await a cache write whose failure must not fail the caller.
    async fn populate<F>(&self, op: &'static str, write: F)
    where
        F: Future<Output = CacheResult<()>>,
    {
        if let Err(e) = write.await {
            tracing::warn!(
                op,
                cache_type = %self.backend.cache_type(),
                error = %e,
                "cache population failed"
            );
        }
    }
}
