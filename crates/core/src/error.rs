//! Error types for the engine core.

use crate::types::SessionId;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the session manager, connection pool and config loader.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Unknown or closed session; the caller must re-handshake.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// No pooled connection became available within the acquire timeout.
    #[error("Connection pool exhausted after waiting {waited_ms}ms (max size {max_size})")]
    PoolExhausted { waited_ms: u64, max_size: usize },

    /// The pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The connector failed to open a new connection.
    #[error("Failed to open connection: {0}")]
    Connect(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error.
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error came from a bounded wait running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
