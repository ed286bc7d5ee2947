//! # Stowage
//!
//! Resilient, pooled access to three backing stores:
//!
//! - **Vector store**: Milvus collections with a fixed document schema and an
//!   IVF index, reached over the Milvus RESTful API
//! - **Relational store**: PostgreSQL, driven synchronously on top of `tokio-postgres`
//! - **Cache**: Redis strings and list-based queues
//!
//! Every client sits on the same two primitives: a [`ResilientPool`] of
//! pre-established connections with lazy liveness probing, and a
//! [`RetryingOperation`] that reconnects a failed slot and retries once.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stowage::config::StowageConfig;
//! use stowage::storage::cache::{CacheClient, RedisConnector};
//!
//! let config = StowageConfig::load_default();
//! let cache = CacheClient::connect(RedisConnector::new(&config.cache)?, &config.cache)?;
//! cache.set("greeting", 42)?;
//! assert_eq!(cache.get("greeting")?.as_deref(), Some("42"));
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod observability;
pub mod storage;

// Re-exports for convenience
pub use config::{StoreSettings, StowageConfig};
pub use storage::{
    Connector, PoolConfig, PoolStatus, PooledSlot, ProcessHandle, ResilientPool,
    RetryingOperation, SlotId,
};

/// Error type for stowage operations.
///
/// Every variant maps to exactly one [`ErrorKind`]; the pool and the store
/// clients decide between reconnecting, retrying and re-raising by looking at
/// that kind only.
///
/// | Variant | Kind | Raised When |
/// |---------|------|-------------|
/// | `InvalidInput` | Caller | Bad identifiers, dimension mismatches, malformed settings |
/// | `Connection` | Transient | Socket errors, timeouts, refused or dropped connections |
/// | `PoolExhausted` | Transient | Every slot stayed outstanding for the whole acquire timeout |
/// | `Backend` | Domain | The server answered with an error (SQL error, collection not loaded) |
/// | `OperationFailed` | Fatal | Anything unexpected |
/// | `Lifecycle` | Fatal | Using a client after shutdown, re-initializing after shutdown |
/// | `FeatureNotEnabled` | Fatal | Backend compiled out |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A connection-level failure: the backend could not be reached or the
    /// socket timed out.
    #[error("{backend} connection failed: {cause}")]
    Connection {
        /// Backend that failed.
        backend: &'static str,
        /// The underlying cause.
        cause: String,
    },

    /// No slot became available before the acquire timeout elapsed.
    #[error("{backend} pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted {
        /// Backend whose pool is exhausted.
        backend: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The backend reported an error for an otherwise healthy connection.
    #[error("{backend} error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Backend {
        /// Backend that reported the error.
        backend: &'static str,
        /// Backend-specific numeric error code, when one is reported.
        code: Option<i64>,
        /// The backend's message.
        message: String,
    },

    /// An operation failed unexpectedly.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A client or pool was used outside its lifetime.
    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

/// Classification used for reconnect and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connectivity or timeout failure; reconnect and retry once.
    Transient,
    /// Backend-reported failure on a healthy connection; surfaced as-is.
    Domain,
    /// Bad caller input; never retried.
    Caller,
    /// Unexpected failure; reconnect, then re-raise.
    Fatal,
}

impl Error {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::PoolExhausted { .. } => ErrorKind::Transient,
            Self::Backend { .. } => ErrorKind::Domain,
            Self::InvalidInput(_) => ErrorKind::Caller,
            Self::OperationFailed { .. } | Self::Lifecycle(_) | Self::FeatureNotEnabled(_) => {
                ErrorKind::Fatal
            },
        }
    }

    /// Returns `true` if the error is a transient connectivity failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns the backend error code, if this is a [`Error::Backend`].
    #[must_use]
    pub const fn backend_code(&self) -> Option<i64> {
        match self {
            Self::Backend { code, .. } => *code,
            _ => None,
        }
    }
}

/// Result type alias for stowage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::Backend {
            backend: "milvus",
            code: Some(101),
            message: "collection not loaded".to_string(),
        };
        assert_eq!(err.to_string(), "milvus error 101: collection not loaded");

        let err = Error::Backend {
            backend: "postgres",
            code: None,
            message: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "postgres error: syntax error");
    }

    #[test]
    fn test_error_kinds() {
        let transient = Error::Connection {
            backend: "redis",
            cause: "refused".to_string(),
        };
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert!(transient.is_transient());

        let exhausted = Error::PoolExhausted {
            backend: "redis",
            waited_ms: 10,
        };
        assert!(exhausted.is_transient());

        let domain = Error::Backend {
            backend: "milvus",
            code: Some(1100),
            message: "not loaded".to_string(),
        };
        assert_eq!(domain.kind(), ErrorKind::Domain);
        assert_eq!(domain.backend_code(), Some(1100));

        assert_eq!(
            Error::InvalidInput(String::new()).kind(),
            ErrorKind::Caller
        );
        assert_eq!(Error::Lifecycle(String::new()).kind(), ErrorKind::Fatal);
        assert_eq!(transient.backend_code(), None);
    }
}
