//! Domain-specific error types for the Tether transport.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Transport faults are recovered at the pump loop or broadcast loop that
//! detects them; only local failures are expected to reach a caller as-is.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::call::{Status, StatusCode};

/// The canonical error type for the Tether transport.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the Tether magic sequence.
    #[error("invalid magic bytes: expected TTH1")]
    InvalidMagic,

    /// A field in the frame header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A frame violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Framing Errors ───────────────────────────────────────────
    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The received frame is shorter or longer than expected.
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The channel or one of its streams was closed underneath us.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A JSON document could not be parsed or produced.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Remote Errors ────────────────────────────────────────────
    /// The peer terminated the call with a non-OK status.
    #[error("call failed with {}: {}", .0.code, .0.message)]
    Status(Status),

    /// The peer reported a failure inside a response payload
    /// (error-bearing chunk, negative ack, failed upload status).
    #[error("remote error: {0}")]
    Remote(String),

    // ── Local Errors ─────────────────────────────────────────────
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Sealing or opening a credential failed.
    #[error("vault error: {0}")]
    Vault(String),

    /// A path supplied by a peer or a caller is not acceptable.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The requested feature is not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl TetherError {
    /// Returns the status code carried by a remote status failure.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            TetherError::Status(status) => Some(status.code),
            _ => None,
        }
    }

    /// Returns `true` when the error means the underlying link is gone
    /// rather than a single call having failed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TetherError::Connection(_)
                | TetherError::ChannelClosed
                | TetherError::InvalidMagic
                | TetherError::ChecksumMismatch
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TetherError {
    fn from(s: String) -> Self {
        TetherError::Other(s)
    }
}

impl From<&str> for TetherError {
    fn from(s: &str) -> Self {
        TetherError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TetherError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        TetherError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for TetherError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TetherError::Encoding(e.to_string())
    }
}

impl From<Status> for TetherError {
    fn from(status: Status) -> Self {
        TetherError::Status(status)
    }
}
