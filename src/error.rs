//! `aibridge` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use thiserror::Error;

/// Top-level error type for `aibridge`
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Cancellation: {0}")]
    Cancellation(#[from] CancellationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON-RPC envelope errors (malformed or invalid messages)
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl ProtocolError {
    /// Create a parse error from a serde failure
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an invalid-request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid-params error
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParams(msg.into())
    }
}

/// Session registry errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Session '{id}' not found")]
    NotFound { id: String },

    #[error("Session '{id}' expired after {ttl_secs}s of inactivity")]
    Expired { id: String, ttl_secs: u64 },

    #[error("Session '{id}' is terminated")]
    Terminated { id: String },

    #[error("Invalid session state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

/// Request tracker errors
#[derive(Error, Debug, Clone)]
pub enum RequestError {
    #[error("Request '{id}' is already being tracked")]
    DuplicateRequestId { id: String },

    #[error("Request '{id}' not found")]
    NotFound { id: String },
}

/// Cancellation outcomes, distinguishable from generic failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancellationError {
    #[error("Request '{id}' was cancelled")]
    Cancelled { id: String },

    #[error("Request '{id}' timed out after {timeout_secs}s")]
    TimedOut { id: String, timeout_secs: u64 },
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport already started")]
    AlreadyStarted,

    #[error("Transport is closed")]
    Closed,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create a write-failure error
    pub fn write_failed<S: Into<String>>(msg: S) -> Self {
        Self::WriteFailed(msg.into())
    }
}

/// Upstream AI backend errors
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Upstream stream error: {0}")]
    Stream(String),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl UpstreamError {
    /// Create a request-failure error
    pub fn request_failed<S: Into<String>>(msg: S) -> Self {
        Self::RequestFailed(msg.into())
    }

    /// Create an invalid-response error
    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create a stream error
    pub fn stream<S: Into<String>>(msg: S) -> Self {
        Self::Stream(msg.into())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {reason}")]
    FileReadFailed { path: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for `aibridge` operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Result type alias for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Result type alias for request tracking operations
pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for upstream AI calls
pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// Result type alias for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RequestError::DuplicateRequestId {
            id: "42".to_string(),
        };
        assert_eq!(err.to_string(), "Request '42' is already being tracked");

        let err = CancellationError::TimedOut {
            id: "7".to_string(),
            timeout_secs: 60,
        };
        assert_eq!(err.to_string(), "Request '7' timed out after 60s");
    }

    #[test]
    fn test_error_conversion() {
        let proto_err = ProtocolError::parse("unexpected token");
        let bridge_err: BridgeError = proto_err.into();
        assert!(matches!(bridge_err, BridgeError::Protocol(_)));

        let transport_err = TransportError::Closed;
        let bridge_err: BridgeError = transport_err.into();
        assert!(matches!(bridge_err, BridgeError::Transport(_)));
    }

    #[test]
    fn test_cancellation_is_distinguishable() {
        let cancelled = CancellationError::Cancelled {
            id: "1".to_string(),
        };
        let timed_out = CancellationError::TimedOut {
            id: "1".to_string(),
            timeout_secs: 1,
        };
        assert_ne!(cancelled, timed_out);
    }
}
