//! Error types for link operations
//!
//! This module provides the error taxonomy for the device link layer:
//! transport failures, frame decoding, protocol contract violations and
//! lifecycle errors.

use thiserror::Error;

/// Main error type for link operations
#[derive(Error, Debug)]
pub enum LinkError {
    // ===== Transport Errors =====
    /// Writing to the connection failed
    #[error("Connection write error: {0}")]
    WriteError(String),

    /// Reading from the connection failed
    #[error("Connection read error: {0}")]
    ReadError(String),

    /// The underlying connection is gone
    #[error("Connection disconnected")]
    Disconnected,

    /// The link was closed and accepts no further commands
    #[error("Link is closed")]
    Closed,

    /// Operation timed out
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Protocol Errors =====
    /// A frame could not be decoded
    #[error("Cannot decode frame {frame:?}: {reason}")]
    Decode {
        /// The offending frame, lossily rendered
        frame: String,
        /// Why decoding failed
        reason: String,
    },

    /// A decoded message breaks the protocol contract
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The codec cannot express the command
    #[error("Protocol {protocol} does not support {command}")]
    UnsupportedCommand {
        /// Protocol name
        protocol: String,
        /// Command name
        command: String,
    },

    /// The codec has no reply support but a reply id was requested
    #[error("Protocol {0} does not support replies")]
    ReplyNotSupported(String),

    /// No codec is registered under this name
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// A command argument is out of range for the wire format
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    // ===== General Errors =====
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Build a decode error for a raw frame
    pub fn decode(frame: &[u8], reason: impl Into<String>) -> Self {
        LinkError::Decode {
            frame: String::from_utf8_lossy(frame).into_owned(),
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout { .. }
                | LinkError::Disconnected
                | LinkError::ReadError(_)
                | LinkError::WriteError(_)
        )
    }

    /// Check if this is a protocol error (bad data from device)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LinkError::Decode { .. } | LinkError::ProtocolViolation(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::WriteError(_) => "WRITE_ERROR",
            LinkError::ReadError(_) => "READ_ERROR",
            LinkError::Disconnected => "DISCONNECTED",
            LinkError::Closed => "LINK_CLOSED",
            LinkError::Timeout { .. } => "TIMEOUT",
            LinkError::Decode { .. } => "DECODE_ERROR",
            LinkError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            LinkError::UnsupportedCommand { .. } => "UNSUPPORTED_COMMAND",
            LinkError::ReplyNotSupported(_) => "REPLY_NOT_SUPPORTED",
            LinkError::UnknownProtocol(_) => "UNKNOWN_PROTOCOL",
            LinkError::InvalidValue(_) => "INVALID_VALUE",
            LinkError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::Io(kind) => {
                LinkError::Io(std::io::Error::new(kind, err.description))
            }
            _ => LinkError::ReadError(err.description),
        }
    }
}
