//! Error types for dcc-bridge.
//!
//! Each concern gets its own enum. Only [`ToolError`] and [`BridgeError`] are
//! ever turned into protocol error responses; transport and configuration
//! failures terminate a connection or the process instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Connection-level failures. None of these produce a response; the
/// connection is closed.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying socket or pipe failed.
    #[error("transport I/O failed")]
    Io(#[from] std::io::Error),

    /// A length prefix announced a frame larger than the configured ceiling.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("stream closed with {buffered} bytes of an incomplete frame")]
    Truncated {
        /// Bytes that were buffered when the stream closed.
        buffered: usize,
    },

    /// A frame payload was not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// WebSocket protocol failure.
    #[error("websocket failure")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A binary frame arrived on the message-oriented transport.
    #[error("unexpected binary websocket message")]
    UnexpectedBinary,
}

/// Failures of the Transport Bridge itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The host side of the bridge is gone (host thread exited).
    #[error("host bridge is closed")]
    Closed,

    /// A call descriptor or result could not be encoded at the boundary.
    #[error("failed to encode bridge message: {0}")]
    Encode(String),

    /// A bridge message could not be decoded.
    #[error("failed to decode bridge message: {0}")]
    Decode(String),

    /// A call descriptor was unreadable apart from its correlation id.
    #[error("malformed call descriptor {correlation_id}: {reason}")]
    Malformed {
        /// Id recovered from the descriptor.
        correlation_id: u64,
        /// Why the rest could not be decoded.
        reason: String,
    },

    /// The correlation id is still owned by a live pending call.
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(u64),

    /// No result arrived before the deadline.
    #[error("call timed out after {0} ms")]
    Timeout(u128),

    /// The session that owned the call was closed.
    #[error("call cancelled")]
    Cancelled,

    /// A blocking wait was attempted on a thread that must never block.
    #[error("deadlock avoided: {0}")]
    DeadlockAvoided(&'static str),

    /// The server stopped before the call completed.
    #[error("server shutting down")]
    ShuttingDown,
}

/// Errors raised by host-operation leaves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The named object does not exist in the scene.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The object exists but is the wrong kind for the operation.
    #[error("object '{name}' is not a {expected}")]
    WrongKind {
        /// Object name.
        name: String,
        /// Kind the operation required.
        expected: &'static str,
    },

    /// A name failed validation.
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// A configured scene limit would be exceeded.
    #[error("scene limit reached: {0}")]
    LimitReached(String),

    /// Any other host-side failure.
    #[error("{0}")]
    Failed(String),
}

/// Error returned by a tool handler.
///
/// The variant selects the protocol error code the scheduler reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The handler rejected its parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler failed for a reason of its own.
    #[error("{0}")]
    Execution(String),

    /// The host application reported a failure.
    #[error(transparent)]
    Host(#[from] HostError),

    /// No host implementation is attached to the scheduler.
    #[error("no host implementation registered")]
    HostUnavailable,
}

impl ToolError {
    /// Short machine-readable kind, reported in the error `data` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "invalid_params",
            Self::Execution(_) => "execution",
            Self::Host(_) => "host",
            Self::HostUnavailable => "host_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let error = ConfigError::NotFound {
            path: PathBuf::from("/path/to/config.json"),
        };
        let msg = error.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("config.json"));
    }

    #[test]
    fn validation_error_display() {
        let error = ConfigError::ValidationError {
            message: "invalid setting".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("invalid setting"));
    }

    #[test]
    fn host_error_converts_into_tool_error() {
        let err: ToolError = HostError::ObjectNotFound("Cube".into()).into();
        assert_eq!(err.kind(), "host");
        assert_eq!(err.to_string(), "object not found: Cube");
    }

    #[test]
    fn frame_too_large_mentions_both_sizes() {
        let msg = TransportError::FrameTooLarge { len: 10, max: 4 }.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('4'));
    }
}
