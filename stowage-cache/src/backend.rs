//! Cache backend trait.
//!
//! This module defines the storage-agnostic contract every backend
//! implements. The table cache is written against this trait only, so a
//! backend can be swapped (Redis in production, memory in tests) without
//! touching the coordination logic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use stowage_core::{CacheError, CacheResult};

/// Key/value contract for a cache store.
///
/// # Keys
///
/// Every key passed in or handed back is a *logical* key. Implementations
/// prepend their configured prefix before talking to the store and strip it
/// from keys they return.
///
/// # TTL
///
/// A `ttl` of [`Duration::ZERO`] stores the entry without expiry.
///
/// # Cancellation
///
/// Every operation is a future; dropping it (directly or through
/// `tokio::time::timeout`) abandons the in-flight store call.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Whether `value` is this backend's empty marker.
    fn is_empty(&self, value: &str) -> bool;

    /// Get one value. Fails with `NotFound` when absent.
    async fn get(&self, key: &str) -> CacheResult<String>;

    /// Get many values. Absent keys are missing from the map; an empty
    /// `keys` slice is a `BadRequest`.
    async fn mget(&self, keys: &[String]) -> CacheResult<HashMap<String, String>>;

    /// Collect every entry whose logical key starts with `prefix`, scanning
    /// `scan_count` keys per page.
    async fn prefix_get(
        &self,
        prefix: &str,
        scan_count: u64,
    ) -> CacheResult<HashMap<String, String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Write many values in one round trip. Not atomic across keys.
    async fn mset(&self, data: &HashMap<String, String>, ttl: Duration) -> CacheResult<()>;

    /// Write the empty marker for `key`.
    async fn set_empty(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Write the empty marker for every key in one round trip.
    async fn mset_empty(&self, keys: &[String], ttl: Duration) -> CacheResult<()>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    async fn mdel(&self, keys: &[String]) -> CacheResult<()>;

    /// Delete every entry whose logical key starts with `prefix`.
    async fn prefix_del(&self, prefix: &str, scan_count: u64) -> CacheResult<()>;

    /// Delete everything under this backend's prefix.
    async fn clear(&self, scan_count: u64) -> CacheResult<()>;

    /// Release the underlying connections. Later calls fail with
    /// `InternalServerError`.
    async fn close(&self) -> CacheResult<()>;

    /// Page size for prefix scans when the caller has no preference.
    fn scan_count(&self) -> u64;

    /// Short backend name, e.g. `"redis"`.
    fn cache_type(&self) -> &str;

    /// The key prefix this backend writes under.
    fn prefix(&self) -> &str;
}

/// Reject an empty batch before any store call.
pub(crate) fn require_non_empty(len: usize) -> CacheResult<()> {
    if len == 0 {
        return Err(CacheError::bad_request("parameter error: no keys given"));
    }
    Ok(())
}

/// Reject a zero page size, which the store would treat as a syntax error.
pub(crate) fn require_scan_count(scan_count: u64) -> CacheResult<()> {
    if scan_count == 0 {
        return Err(CacheError::bad_request(
            "parameter error: scan count must be greater than zero",
        ));
    }
    Ok(())
}
