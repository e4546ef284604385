//! Error types for the RFB protocol engine.

use std::io;
use thiserror::Error;

/// Result type for RFB operations.
pub type Result<T> = std::result::Result<T, RfbError>;

/// Errors that can occur in an RFB session.
///
/// Every failure is local to the session it occurred on: server sessions log
/// and tear down, the client additionally surfaces one human-readable message
/// through its [`FrameSink`](crate::FrameSink).
#[derive(Debug, Error)]
pub enum RfbError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection mid-session.
    #[error("Connection closed by peer")]
    Disconnected,

    /// A read did not complete within its configured bound.
    #[error("Timed out waiting for data")]
    Timeout,

    /// The initial connection was not established within the connect timeout.
    #[error("Connection attempt timed out")]
    ConnectTimeout,

    /// A buffer ended before a declared length was satisfied.
    #[error("Input truncated")]
    TruncatedInput,

    /// The peer sent something the protocol subset does not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The security handshake was refused.
    #[error("Security handshake rejected: {0}")]
    SecurityRejected(String),

    /// A server-to-client message type this client does not handle.
    #[error("Unsupported message type {0}")]
    UnsupportedMessage(u8),
}
