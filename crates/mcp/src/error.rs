//! Error types for transports and the MCP server.

use crate::protocol::RequestId;
use switchboard_core::CoreError;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by a transport to the caller of one of its operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{transport} transport is already running")]
    AlreadyRunning { transport: String },

    #[error("{transport} transport is not running")]
    NotRunning { transport: String },

    /// A correlated request got no response in time.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{transport} transport does not support send_request: requires request/response correlation")]
    CorrelationUnsupported { transport: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send message: {0}")]
    Send(String),

    /// The connection dropped while the request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(RequestId),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether this error came from a bounded wait running out of time.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Whether the underlying connection should be considered broken.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::ConnectionClosed
            | Self::NotRunning { .. }
            | Self::Send(_)
            | Self::WebSocket(_)
            | Self::Io(_) => true,
            Self::Http(e) => e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Result type for server and outbound client operations.
pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Server is already running")]
    AlreadyRunning,

    /// A transport failed during server startup; nothing was left running.
    #[error("Failed to start {transport} transport: {source}")]
    StartFailed {
        transport: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Registry(#[from] crate::tools::RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl McpError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Core(e) => e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(TransportError::Timeout { timeout_ms: 10 }.is_timeout());
        assert!(!TransportError::ConnectionClosed.is_timeout());

        let err: McpError = CoreError::PoolExhausted {
            waited_ms: 5,
            max_size: 1,
        }
        .into();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_correlation_unsupported_message() {
        let err = TransportError::CorrelationUnsupported {
            transport: "stdio".to_string(),
        };
        assert!(err.to_string().contains("requires request/response correlation"));
        assert!(!err.is_connection_failure());
    }
}
