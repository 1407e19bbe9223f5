//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or parsing protocol messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type byte
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds the 16-bit length field
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Declared payload length is below the per-type minimum
    #[error("invalid message length for {name}: at least {min}, got {got}")]
    ShortPayload {
        name: &'static str,
        min: usize,
        got: usize,
    },

    /// A payload field could not be parsed
    #[error("malformed {0} payload")]
    Malformed(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
