//! Error types for the secure transport layer
//!
//! Failures here terminate the connection attempt or the active session,
//! never the hosting process.

use thiserror::Error;

/// Result alias used throughout the crate
pub type SecureResult<T> = Result<T, SecureError>;

/// Errors raised by the secure transport layer
#[derive(Debug, Error)]
pub enum SecureError {
    /// Malformed server data: length fields out of bounds, magic mismatch,
    /// or a truncated buffer. Fatal to the connection attempt.
    #[error("malformed server data: {0}")]
    Malformed(String),

    /// Trust failure: the certificate chain rejected the leaf, or a declared
    /// key signature failed verification. Aborts the handshake.
    #[error("server credential rejected: {0}")]
    Trust(String),

    /// A certificate could not be turned into a usable object.
    #[error("certificate processing failed: {0}")]
    Certificate(String),

    /// I/O failure reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl SecureError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
