//! Frame kinds and RPC method identifiers.
//!
//! Uses proper enums with `TryFrom`: no panics on unknown values.

use crate::error::TetherError;
use std::fmt;

// ── FrameKind ────────────────────────────────────────────────────

/// The role a frame plays in the lifecycle of a logical stream.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Opens a stream; payload carries the call metadata.
    Open = 0x1,
    /// One message on an open stream.
    Data = 0x2,
    /// The sender will not send further messages on this stream.
    End = 0x3,
    /// Terminates the stream; payload carries a `Status`.
    Status = 0x4,
    /// The caller abandons the stream.
    Reset = 0x5,
    /// Link keep-alive on stream 0.
    Heartbeat = 0x6,
}

impl TryFrom<u32> for FrameKind {
    type Error = TetherError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(FrameKind::Open),
            0x2 => Ok(FrameKind::Data),
            0x3 => Ok(FrameKind::End),
            0x4 => Ok(FrameKind::Status),
            0x5 => Ok(FrameKind::Reset),
            0x6 => Ok(FrameKind::Heartbeat),
            _ => Err(TetherError::UnknownVariant {
                type_name: "FrameKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FrameKind {
    /// Returns `true` for frames after which the stream no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameKind::Status | FrameKind::Reset)
    }
}

// ── Method ───────────────────────────────────────────────────────

/// Every RPC understood by the Tether protocol.
///
/// Organized by category:
/// - `0x01xx`: JSON messaging
/// - `0x02xx`: File operations
/// - `0x03xx`: Screen capture
/// - `0x04xx`: Push subscriptions
/// - `0x05xx`: Byte messages
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    // ── JSON (0x01xx) ────────────────────────────────────────────
    /// Client streams envelopes, server acks each one by id.
    JsonStream = 0x0101,
    /// Client streams envelopes (not acked); server pushes envelopes back.
    JsonDuplex = 0x0102,

    // ── File (0x02xx) ────────────────────────────────────────────
    /// Client streams chunks; server answers with one upload status.
    Upload = 0x0201,
    /// Client sends a path; server streams chunks.
    Download = 0x0202,
    /// Client sends a directory; server answers with its file names.
    ListFiles = 0x0203,

    // ── Screen (0x03xx) ──────────────────────────────────────────
    /// Client sends a monitor index; server streams image chunks.
    Screenshot = 0x0301,

    // ── Subscriptions (0x04xx) ───────────────────────────────────
    /// Receive-only stream of broadcast file chunks.
    SubscribeFiles = 0x0401,
    /// Receive-only stream of broadcast byte messages.
    SubscribeBytes = 0x0402,

    // ── Bytes (0x05xx) ───────────────────────────────────────────
    /// Unary byte message, acknowledged.
    SendBytes = 0x0501,
    /// Unary byte message, fire-and-forget.
    SendBytesNoAck = 0x0502,
}

impl TryFrom<u64> for Method {
    type Error = TetherError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x0101 => Ok(Method::JsonStream),
            0x0102 => Ok(Method::JsonDuplex),

            0x0201 => Ok(Method::Upload),
            0x0202 => Ok(Method::Download),
            0x0203 => Ok(Method::ListFiles),

            0x0301 => Ok(Method::Screenshot),

            0x0401 => Ok(Method::SubscribeFiles),
            0x0402 => Ok(Method::SubscribeBytes),

            0x0501 => Ok(Method::SendBytes),
            0x0502 => Ok(Method::SendBytesNoAck),

            _ => Err(TetherError::UnknownVariant {
                type_name: "Method",
                value,
            }),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Method {
    /// Returns `true` for receive-only subscription streams that stay
    /// open until the subscriber leaves.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Method::JsonDuplex | Method::SubscribeFiles | Method::SubscribeBytes
        )
    }
}
