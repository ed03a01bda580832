//! Error types for the wire layer

use thiserror::Error;

/// Wire-level error types
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("buffer underflow: need {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("endpoint in use: {0}")]
    EndpointInUse(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl WireError {
    /// Whether this error is a read or write timeout on the underlying socket.
    pub fn is_timeout(&self) -> bool {
        match self {
            WireError::Timeout => true,
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
