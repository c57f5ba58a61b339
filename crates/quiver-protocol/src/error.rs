//! Protocol error types

use thiserror::Error;

/// Protocol error types
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of negotiation bodies failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame larger than the accepted maximum
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Frame type outside response/error/message
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u32),

    /// Message frame too short or otherwise malformed
    #[error("Invalid message frame: {0}")]
    InvalidMessage(String),

    /// Message identifier that is not exactly 16 bytes
    #[error("Invalid message id: {0:?}")]
    InvalidMessageId(String),

    /// Topic or channel name rejected by the broker's naming rules
    #[error("Invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    /// Broker answered a command with an error frame
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker answered with something other than what the handshake expects
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
