//! MCP error types.

use crate::jsonrpc::{DecodeError, JsonRpcError};
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The peer answered with a JSON-RPC error.
    #[error("{0}")]
    Rpc(JsonRpcError),

    /// A retryable HTTP failure (429, 502, 503, 504). The session stays usable.
    #[error("Transient HTTP failure: {0}")]
    Transient(String),

    /// A non-retryable HTTP failure. The session is no longer usable.
    #[error("Fatal HTTP failure: {0}")]
    Fatal(String),

    /// The server failed with a 5xx that is not classified as transient.
    #[error("Server error: {0}")]
    Server(String),

    /// An earlier fatal failure broke the session.
    #[error("Session broken: {0}")]
    SessionBroken(String),

    /// The reply stream closed before any resumable event was seen.
    #[error("request terminated without response")]
    TerminatedWithoutResponse,

    /// Resumption attempts ran past the reconnect deadline.
    #[error("Reconnect gave up: {0}")]
    ReconnectExhausted(String),

    /// The standalone SSE stream could not be opened.
    #[error("Failed to open standalone SSE stream: {0}")]
    StandaloneStream(String),

    /// The caller cancelled the operation.
    #[error("Request cancelled")]
    Cancelled,

    /// The session or transport is closed.
    #[error("Session closed")]
    Closed,

    /// The peer negotiated a protocol version this side does not speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    /// Server initialization failed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A message failed to decode.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Timed out waiting for the peer.
    #[error("Timed out")]
    Timeout,
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Map a reqwest send failure, keeping timeouts and refused connections apart.
    pub fn from_send(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::connection_failed(format!("Connection failed: {error}"))
        } else {
            Self::Http(error)
        }
    }

    /// Whether the failed call can be retried on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Server(_) | Self::Timeout | Self::ConnectionFailed(_)
        )
    }

    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal(_) | Self::SessionBroken(_) | Self::StandaloneStream(_)
        )
    }

    /// The JSON-RPC error carried by this failure, if any.
    pub fn rpc(&self) -> Option<&JsonRpcError> {
        match self {
            Self::Rpc(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the peer answered with a JSON-RPC error.
    pub fn is_rpc(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

impl From<JsonRpcError> for McpError {
    fn from(error: JsonRpcError) -> Self {
        Self::Rpc(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::codes;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::ConnectionFailed("timeout".to_string()),
                "Connection failed: timeout",
            ),
            (
                McpError::ProtocolError("invalid".to_string()),
                "Protocol error: invalid",
            ),
            (
                McpError::Transient("POST: 503 Service Unavailable".to_string()),
                "Transient HTTP failure: POST: 503 Service Unavailable",
            ),
            (
                McpError::TerminatedWithoutResponse,
                "request terminated without response",
            ),
            (
                McpError::StandaloneStream("500 Internal Server Error".to_string()),
                "Failed to open standalone SSE stream: 500 Internal Server Error",
            ),
            (McpError::Cancelled, "Request cancelled"),
            (McpError::Closed, "Session closed"),
            (McpError::Timeout, "Timed out"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_rpc_error_display_and_accessor() {
        let error = McpError::from(JsonRpcError::method_not_found("tools/frobnicate"));
        assert!(error.to_string().contains("tools/frobnicate"));
        assert_eq!(error.rpc().map(|e| e.code), Some(codes::METHOD_NOT_FOUND));
        assert!(McpError::Closed.rpc().is_none());
    }

    #[test]
    fn test_classification() {
        assert!(McpError::Transient("429".into()).is_transient());
        assert!(McpError::Server("500".into()).is_transient());
        assert!(!McpError::Transient("429".into()).is_fatal());

        assert!(McpError::Fatal("401 Unauthorized".into()).is_fatal());
        assert!(McpError::SessionBroken("gone".into()).is_fatal());
        assert!(!McpError::Fatal("401".into()).is_transient());

        assert!(!McpError::TerminatedWithoutResponse.is_fatal());
        assert!(!McpError::ReconnectExhausted("deadline".into()).is_fatal());
    }

    #[test]
    fn test_error_constructors() {
        let conn_err = McpError::connection_failed("failed to connect");
        assert!(conn_err.to_string().contains("Connection failed"));

        let proto_err = McpError::protocol_error("invalid message");
        assert!(proto_err.to_string().contains("Protocol error"));
    }
}
