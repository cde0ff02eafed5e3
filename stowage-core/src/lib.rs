//! Stowage Core - Shared Types
//!
//! Error taxonomy, configuration and logging setup shared by every Stowage
//! crate. This crate has no I/O of its own.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BackendConfig, RedisConfig, StowageConfig, TableConfig, DEFAULT_EXPIRE_SECS,
    DEFAULT_MGET_CHUNK_SIZE, DEFAULT_SCAN_COUNT,
};
pub use error::{CacheError, CacheResult, ConfigError, ErrorKind};
pub use logging::{init_logging, LogConfig};
