//! Errors from the wire layer.

use thiserror::Error;

/// Errors from the wire protocol and node runtime.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame: invalid JSON or a payload that does not match its type.
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Node is already running")]
    AlreadyRunning,
}

/// Error returned by a message handler.
///
/// Handler errors are logged by the node and never reach other handlers or
/// the connection's read loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}
