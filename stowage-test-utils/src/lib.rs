//! Stowage Test Utilities
//!
//! Shared test infrastructure for the Stowage workspace:
//! - A scripted origin table with call counters
//! - Proptest generators for keys, prefixes and values
//! - Fixtures for common backend and table setups

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

// Re-export the types every test touches
pub use stowage_cache::{CacheBackend, MemoryCache, TableCache, TableContent};
pub use stowage_core::{init_logging, CacheError, CacheResult, LogConfig};

/// Install a debug-level subscriber for test output. Safe to call from
/// every test; only the first call installs anything.
pub fn init_test_logging() {
    let _ = init_logging(&LogConfig {
        filter: "debug".to_string(),
        json: false,
    });
}

// ============================================================================
// ORIGIN STUB
// ============================================================================

/// In-memory origin table keyed by `u64` ids, cached under `user:{id}`.
///
/// Counts every origin call so tests can assert how often the cache fell
/// through.
#[derive(Debug, Default)]
pub struct CountingContent {
    rows: DashMap<u64, String>,
    prevent: bool,
    delay: Option<Duration>,
    failure: Option<CacheError>,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batches: Mutex<Vec<Vec<u64>>>,
}

impl CountingContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(self, id: u64, value: impl Into<String>) -> Self {
        self.rows.insert(id, value.into());
        self
    }

    pub fn with_rows<I, V>(self, rows: I) -> Self
    where
        I: IntoIterator<Item = (u64, V)>,
        V: Into<String>,
    {
        for (id, value) in rows {
            self.rows.insert(id, value.into());
        }
        self
    }

    /// Negative-cache origin misses.
    pub fn prevent_penetration(mut self, prevent: bool) -> Self {
        self.prevent = prevent;
        self
    }

    /// Sleep this long inside every origin call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every origin call with `error`.
    pub fn failing_with(mut self, error: CacheError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Change the origin after construction.
    pub fn insert_row(&self, id: u64, value: impl Into<String>) {
        self.rows.insert(id, value.into());
    }

    pub fn remove_row(&self, id: u64) {
        self.rows.remove(&id);
    }

    pub fn key(id: u64) -> String {
        format!("user:{}", id)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Params of every batch call, in call order, each sorted.
    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn before_call(&self) -> CacheResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TableContent<u64> for CountingContent {
    fn get_key(&self, param: &u64) -> String {
        Self::key(*param)
    }

    async fn get_value(&self, param: &u64) -> CacheResult<String> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.rows
            .get(param)
            .map(|row| row.value().clone())
            .ok_or_else(|| CacheError::not_found(format!("user {} not found", param)))
    }

    async fn get_value_map(&self, params: &[u64]) -> CacheResult<HashMap<u64, String>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut sorted = params.to_vec();
        sorted.sort_unstable();
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sorted);

        self.before_call().await?;
        Ok(params
            .iter()
            .filter_map(|id| self.rows.get(id).map(|row| (*id, row.value().clone())))
            .collect())
    }

    fn is_prevent_penetration(&self) -> bool {
        self.prevent
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache inputs.

    use proptest::prelude::*;

    /// Logical keys shaped like `table:field:id`, including glob
    /// metacharacters.
    pub fn arb_logical_key() -> impl Strategy<Value = String> {
        "[a-z]{1,8}:[a-z0-9*?\\[\\]]{1,12}"
    }

    /// Backend prefixes, including the empty prefix.
    pub fn arb_prefix() -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), "[a-z]{1,6}:"]
    }

    pub fn arb_value() -> impl Strategy<Value = String> {
        "[ -~]{1,64}"
    }

    /// Origin ids small enough to collide across a batch.
    pub fn arb_ids() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(0u64..32, 1..16)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built backends and table caches.

    use std::sync::Arc;

    use super::*;

    pub const PREFIX: &str = "svc:";
    pub const EXPIRE_SECS: u64 = 60;

    pub fn memory_backend() -> Arc<MemoryCache> {
        Arc::new(MemoryCache::new(PREFIX))
    }

    pub fn table(backend: Arc<MemoryCache>) -> TableCache<MemoryCache> {
        TableCache::new(backend, EXPIRE_SECS)
    }

    /// Table cache over a fresh memory backend, plus a handle on the
    /// backend for direct inspection.
    pub fn memory_table() -> (TableCache<MemoryCache>, Arc<MemoryCache>) {
        let backend = memory_backend();
        (table(Arc::clone(&backend)), backend)
    }
}
