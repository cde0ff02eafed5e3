//! Error types for Stowage cache operations

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Coarse classification of a [`CacheError`], used by callers that branch
/// on the failure class rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    InternalServerError,
    Origin,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InternalServerError => "internal_server_error",
            ErrorKind::Origin => "origin",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// Master error type for the cache layer.
///
/// Errors are `Clone` because a single origin load can be observed by many
/// coalesced callers, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The caller supplied empty or invalid arguments.
    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// A single key is absent, either in the backend or at the origin.
    #[error("Not found: {reason}")]
    NotFound { reason: String },

    /// The backing store failed (connection, protocol, closed backend).
    #[error("Internal server error: {reason}")]
    InternalServerError { reason: String },

    /// Failure reported by a caller-supplied origin loader, passed through
    /// untouched.
    #[error("Origin error: {0}")]
    Origin(Arc<dyn StdError + Send + Sync>),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalServerError {
            reason: reason.into(),
        }
    }

    /// Wrap an arbitrary loader failure.
    pub fn origin<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Origin(Arc::new(err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InternalServerError { .. } => ErrorKind::InternalServerError,
            Self::Origin(_) => ErrorKind::Origin,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadRequest { .. })
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalServerError { .. })
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
