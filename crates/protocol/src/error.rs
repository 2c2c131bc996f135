//! Protocol error types
//!
//! Errors that can occur when framing, parsing, or validating wire messages.

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame header exceeds the size limit
    #[error("frame header size {size} exceeds limit {limit}")]
    HeaderTooLarge { size: usize, limit: usize },

    /// A raw buffer exceeds the size limit
    #[error("raw buffer size {size} exceeds limit {limit}")]
    BufferTooLarge { size: usize, limit: usize },

    /// Header is not valid JSON or does not match any known message
    #[error("invalid frame header: {0}")]
    InvalidHeader(#[from] serde_json::Error),

    /// Unknown policy or location token
    #[error("unknown {field} token: '{token}'")]
    UnknownToken { field: &'static str, token: String },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Data header describes more buffers than the frame carries
    #[error("record headers reference {expected} buffers, frame carries {actual}")]
    BufferCountMismatch { expected: usize, actual: usize },

    /// Record rejected by the schema validator
    #[error("record rejected by schema: {0}")]
    SchemaRejected(String),
}

impl ProtocolError {
    /// Create an unknown token error
    #[inline]
    pub fn unknown_token(field: &'static str, token: impl Into<String>) -> Self {
        Self::UnknownToken {
            field,
            token: token.into(),
        }
    }

    /// Create a header too large error
    #[inline]
    pub fn header_too_large(size: usize) -> Self {
        Self::HeaderTooLarge {
            size,
            limit: crate::MAX_HEADER_SIZE,
        }
    }

    /// Create a buffer too large error
    #[inline]
    pub fn buffer_too_large(size: usize) -> Self {
        Self::BufferTooLarge {
            size,
            limit: crate::MAX_BUFFER_SIZE,
        }
    }

    /// Check if this error leaves the stream decodable (can continue reading)
    ///
    /// Framing errors poison the byte stream and require closing the
    /// connection; content errors affect a single frame only.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownToken { .. } | Self::MissingField(_) | Self::SchemaRejected(_)
        )
    }
}
