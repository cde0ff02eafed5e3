//! Stowage Cache - Cache-Aside Layer
//!
//! A backend-agnostic caching layer that sits between request handlers and
//! an origin data source.
//!
//! # Layers
//!
//! - [`CacheBackend`]: key/value contract with prefixing, TTLs, batch and
//!   prefix operations. [`RedisCache`] talks to a single Redis node;
//!   [`MemoryCache`] keeps everything in process.
//! - [`TableCache`]: read/write-through coordinator driven by a caller's
//!   [`TableContent`] descriptor, with per-key load coalescing through
//!   [`SingleFlight`] and optional negative caching of origin misses.
//!
//! # Example
//!
//! ```ignore
//! let config = StowageConfig::from_env();
//! let backend = Arc::new(RedisCache::connect(&config.redis, &config.backend).await?);
//! let users = TableCache::from_config(backend, &config.table);
//!
//! // Miss -> one origin load per key, however many callers ask at once
//! let name = users.get(&UserTable::new(pool), &42).await?;
//! ```

pub mod backend;
pub mod key;
pub mod memory;
pub mod redis_backend;
pub mod single_flight;
pub mod table;

pub use backend::CacheBackend;
pub use key::{escape_glob, KeyPrefix};
pub use memory::MemoryCache;
pub use redis_backend::RedisCache;
pub use single_flight::SingleFlight;
pub use table::{TableCache, TableContent};

pub use stowage_core::{
    BackendConfig, CacheError, CacheResult, ErrorKind, RedisConfig, StowageConfig, TableConfig,
};
