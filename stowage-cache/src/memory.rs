//! In-process cache backend.
//!
//! Keeps entries in a [`DashMap`] with per-entry deadlines. Expired entries
//! are invisible to readers and purged lazily. Useful for tests and for
//! single-process deployments that do not need a shared store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use stowage_core::{BackendConfig, CacheError, CacheResult, DEFAULT_SCAN_COUNT};
use tokio::time::Instant;

use crate::backend::{require_non_empty, require_scan_count, CacheBackend};
use crate::key::KeyPrefix;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        Self { value, expires_at }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Memory-backed cache.
///
/// Instances created with [`MemoryCache::with_prefix`] share one store,
/// which mirrors several prefixed backends pointing at the same Redis
/// database.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
    prefix: KeyPrefix,
    empty: String,
    scan_count: u64,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Empty store under `prefix`, with the default marker and scan count.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            prefix: KeyPrefix::new(prefix),
            empty: String::new(),
            scan_count: DEFAULT_SCAN_COUNT,
            closed: AtomicBool::new(false),
        }
    }

    /// Empty store with prefix, marker and scan count taken from `config`.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.prefix.clone())
            .with_empty_marker(config.empty_marker.clone())
            .with_scan_count(config.scan_count)
    }

    /// Override the empty marker.
    pub fn with_empty_marker(mut self, marker: impl Into<String>) -> Self {
        self.empty = marker.into();
        self
    }

    /// Override the default scan page size.
    pub fn with_scan_count(mut self, count: u64) -> Self {
        self.scan_count = count.max(1);
        self
    }

    /// A second backend over the same store under a different prefix.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            prefix: KeyPrefix::new(prefix),
            empty: self.empty.clone(),
            scan_count: self.scan_count,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live entries under this backend's prefix.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(self.prefix.as_str()) && !e.value().is_expired(now))
            .count()
    }

    fn check_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::internal("cache backend is closed"));
        }
        Ok(())
    }

    /// Live value for a stored key, purging it if expired.
    fn live_value(&self, full: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(full) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove_if(full, |_, entry| entry.is_expired(now));
        None
    }

    fn insert(&self, key: &str, value: String, ttl: Duration) {
        self.entries
            .insert(self.prefix.apply(key), Entry::new(value, ttl));
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn is_empty(&self, value: &str) -> bool {
        value == self.empty
    }

    async fn get(&self, key: &str) -> CacheResult<String> {
        self.check_open()?;
        self.live_value(&self.prefix.apply(key))
            .ok_or_else(|| CacheError::not_found("cache does not exist"))
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<HashMap<String, String>> {
        require_non_empty(keys.len())?;
        self.check_open()?;

        let mut data = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.live_value(&self.prefix.apply(key)) {
                data.insert(key.clone(), value);
            }
        }
        Ok(data)
    }

    async fn prefix_get(
        &self,
        prefix: &str,
        scan_count: u64,
    ) -> CacheResult<HashMap<String, String>> {
        require_scan_count(scan_count)?;
        self.check_open()?;

        let wanted = self.prefix.apply(prefix);
        let now = Instant::now();
        let data = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&wanted) && !e.value().is_expired(now))
            .filter_map(|e| {
                self.prefix
                    .strip(e.key())
                    .map(|key| (key.to_string(), e.value().value.clone()))
            })
            .collect();
        self.purge_expired();
        Ok(data)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_open()?;
        self.insert(key, value.to_string(), ttl);
        Ok(())
    }

    async fn mset(&self, data: &HashMap<String, String>, ttl: Duration) -> CacheResult<()> {
        require_non_empty(data.len())?;
        self.check_open()?;
        for (key, value) in data {
            self.insert(key, value.clone(), ttl);
        }
        Ok(())
    }

    async fn set_empty(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.check_open()?;
        self.insert(key, self.empty.clone(), ttl);
        Ok(())
    }

    async fn mset_empty(&self, keys: &[String], ttl: Duration) -> CacheResult<()> {
        require_non_empty(keys.len())?;
        self.check_open()?;
        for key in keys {
            self.insert(key, self.empty.clone(), ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        self.check_open()?;
        self.entries.remove(&self.prefix.apply(key));
        Ok(())
    }

    async fn mdel(&self, keys: &[String]) -> CacheResult<()> {
        require_non_empty(keys.len())?;
        self.check_open()?;
        for key in keys {
            self.entries.remove(&self.prefix.apply(key));
        }
        Ok(())
    }

    async fn prefix_del(&self, prefix: &str, scan_count: u64) -> CacheResult<()> {
        require_scan_count(scan_count)?;
        self.check_open()?;
        let doomed = self.prefix.apply(prefix);
        self.entries.retain(|key, _| !key.starts_with(&doomed));
        Ok(())
    }

    async fn clear(&self, scan_count: u64) -> CacheResult<()> {
        self.prefix_del("", scan_count).await
    }

    async fn close(&self) -> CacheResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(prefix = %self.prefix.as_str(), "Memory cache closed");
        }
        Ok(())
    }

    fn scan_count(&self) -> u64 {
        self.scan_count
    }

    fn cache_type(&self) -> &str {
        "memory"
    }

    fn prefix(&self) -> &str {
        self.prefix.as_str()
    }
}
