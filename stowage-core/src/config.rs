//! Configuration types
//!
//! Configuration is loaded from environment variables with sensible defaults
//! for development, or deserialized from any serde-supported format. All
//! values are plain data; the cache crates consume them at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default number of keys sent in one `MGET` round trip.
pub const DEFAULT_MGET_CHUNK_SIZE: usize = 1000;

/// Default `COUNT` hint for `SCAN` iterations.
pub const DEFAULT_SCAN_COUNT: u64 = 100;

/// Default table cache TTL in seconds.
pub const DEFAULT_EXPIRE_SECS: u64 = 60;

// ============================================================================
// REDIS CONNECTION
// ============================================================================

/// Connection parameters for a single Redis node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`.
    pub url: String,
    /// Connect timeout in milliseconds (0 disables the timeout).
    pub connection_timeout_ms: u64,
    /// Per-request timeout in milliseconds (0 disables the timeout).
    pub response_timeout_ms: u64,
    /// Reconnect attempts before a request fails.
    pub number_of_retries: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout_ms: 5_000,
            response_timeout_ms: 3_000,
            number_of_retries: 3,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connection_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.response_timeout_ms)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ============================================================================
// BACKEND
// ============================================================================

/// Per-backend-instance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Namespace prepended to every logical key, e.g. `svc:`.
    pub prefix: String,
    /// Sentinel stored for keys known to be absent at the origin.
    pub empty_marker: String,
    /// Maximum keys per `MGET` round trip.
    pub mget_chunk_size: usize,
    /// `COUNT` hint used by prefix scans when the caller has no preference.
    pub scan_count: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            empty_marker: String::new(),
            mget_chunk_size: DEFAULT_MGET_CHUNK_SIZE,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }
}

impl BackendConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Set the empty marker.
    pub fn with_empty_marker(mut self, marker: impl Into<String>) -> Self {
        self.empty_marker = marker.into();
        self
    }

    /// Set the MGET chunk size.
    pub fn with_mget_chunk_size(mut self, size: usize) -> Self {
        self.mget_chunk_size = size;
        self
    }

    /// Set the scan count hint.
    pub fn with_scan_count(mut self, count: u64) -> Self {
        self.scan_count = count;
        self
    }
}

// ============================================================================
// TABLE CACHE
// ============================================================================

/// Settings for one table cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// TTL applied to values and empty markers; 0 means no expiry.
    pub expire_secs: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            expire_secs: DEFAULT_EXPIRE_SECS,
        }
    }
}

impl TableConfig {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

/// Everything the cache layer consumes from the outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    pub redis: RedisConfig,
    pub backend: BackendConfig,
    pub table: TableConfig,
    pub log: LogConfig,
}

impl StowageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.redis = redis;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_expire_secs(mut self, secs: u64) -> Self {
        self.table.expire_secs = secs;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `STOWAGE_REDIS_URL`: connection URL (default: redis://127.0.0.1:6379/0)
    /// - `STOWAGE_REDIS_CONNECTION_TIMEOUT_MS`: connect timeout (default: 5000)
    /// - `STOWAGE_REDIS_RESPONSE_TIMEOUT_MS`: request timeout (default: 3000)
    /// - `STOWAGE_REDIS_RETRIES`: reconnect attempts (default: 3)
    /// - `STOWAGE_CACHE_PREFIX`: key prefix (default: empty)
    /// - `STOWAGE_CACHE_EMPTY_MARKER`: penetration marker (default: empty)
    /// - `STOWAGE_CACHE_MGET_CHUNK_SIZE`: keys per MGET (default: 1000)
    /// - `STOWAGE_CACHE_SCAN_COUNT`: SCAN COUNT hint (default: 100)
    /// - `STOWAGE_TABLE_EXPIRE_SECS`: table TTL (default: 60)
    /// - `STOWAGE_LOG_FILTER`: tracing filter directive (default: info)
    /// - `STOWAGE_LOG_JSON`: "true" for JSON output (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StowageConfig::from_env`] but with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let redis = RedisConfig {
            url: lookup("STOWAGE_REDIS_URL").unwrap_or(defaults.redis.url),
            connection_timeout_ms: parse_var(&lookup, "STOWAGE_REDIS_CONNECTION_TIMEOUT_MS")
                .unwrap_or(defaults.redis.connection_timeout_ms),
            response_timeout_ms: parse_var(&lookup, "STOWAGE_REDIS_RESPONSE_TIMEOUT_MS")
                .unwrap_or(defaults.redis.response_timeout_ms),
            number_of_retries: parse_var(&lookup, "STOWAGE_REDIS_RETRIES")
                .unwrap_or(defaults.redis.number_of_retries),
        };

        let backend = BackendConfig {
            prefix: lookup("STOWAGE_CACHE_PREFIX").unwrap_or(defaults.backend.prefix),
            empty_marker: lookup("STOWAGE_CACHE_EMPTY_MARKER")
                .unwrap_or(defaults.backend.empty_marker),
            mget_chunk_size: parse_var(&lookup, "STOWAGE_CACHE_MGET_CHUNK_SIZE")
                .unwrap_or(defaults.backend.mget_chunk_size),
            scan_count: parse_var(&lookup, "STOWAGE_CACHE_SCAN_COUNT")
                .unwrap_or(defaults.backend.scan_count),
        };

        let table = TableConfig {
            expire_secs: parse_var(&lookup, "STOWAGE_TABLE_EXPIRE_SECS")
                .unwrap_or(defaults.table.expire_secs),
        };

        let log = LogConfig {
            filter: lookup("STOWAGE_LOG_FILTER").unwrap_or(defaults.log.filter),
            json: lookup("STOWAGE_LOG_JSON")
                .map(|s| s.to_lowercase() == "true" || s == "1")
                .unwrap_or(defaults.log.json),
        };

        Self {
            redis,
            backend,
            table,
            log,
        }
    }

    /// Reject values the cache layer cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "redis.url".to_string(),
            });
        }
        let scheme_ok = ["redis://", "rediss://", "redis+unix://", "unix://"]
            .iter()
            .any(|scheme| self.redis.url.starts_with(scheme));
        if !scheme_ok {
            return Err(ConfigError::InvalidValue {
                field: "redis.url".to_string(),
                value: self.redis.url.clone(),
                reason: "unsupported scheme".to_string(),
            });
        }
        if self.backend.mget_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.mget_chunk_size".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.backend.scan_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.scan_count".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
