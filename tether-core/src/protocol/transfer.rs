//! File transfer payloads: chunks, upload status, listing, screenshots.
//!
//! # Wire Protocol
//!
//! ## Upload (client → server)
//! ```text
//! Client ──[Open Upload]────────────────────► Server
//! Client ──[Data: TransferChunk]────────────► Server   (repeated, index 0..n-1)
//! Client ──[Data: TransferChunk, END_STREAM]► Server   (is_last = true)
//! Server ──[Data: UploadStatus]─────────────► Client
//! Server ──[Status Ok]──────────────────────► Client
//! ```
//!
//! ## Download / Screenshot (server → client)
//! ```text
//! Client ──[Data: DownloadRequest | ScreenshotRequest, END_STREAM]► Server
//! Server ──[Data: TransferChunk]────────────► Client   (repeated)
//! Server ──[Status Ok]──────────────────────► Client
//! ```
//!
//! A missing file is answered with a single chunk whose `error` is set
//! and `is_last = true`, never with a failed status.
//!
//! ## File push (`SubscribeFiles`)
//! ```text
//! Client ──[Open SubscribeFiles]────────────► Server
//! Server ──[Data: TransferChunk]────────────► Client   (one group per broadcast)
//! ```

use serde::{Deserialize, Serialize};

/// Default chunk size for transfers (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

// ── Transfer Chunk ────────────────────────────────────────────────

/// One slice of a larger payload.
///
/// Consecutive chunks sharing `path` form one logical transfer that ends
/// with the chunk whose `is_last` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferChunk {
    /// Logical path or name shared by every chunk of the transfer.
    pub path: String,

    /// The bytes of this slice.
    pub data: Vec<u8>,

    /// Sequential chunk index (0-based).
    pub index: u32,

    /// Number of chunks in the transfer.
    pub total_chunks: u32,

    /// Set only on the final chunk.
    pub is_last: bool,

    /// Set when the sender aborts the transfer.
    pub error: Option<String>,
}

impl TransferChunk {
    /// A terminal chunk reporting that the transfer could not happen.
    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            index: 0,
            total_chunks: 1,
            is_last: true,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Upload Status ─────────────────────────────────────────────────

/// The server's single reply to an upload stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadStatus {
    /// Where the file landed, or the partial path on failure.
    pub path: String,
    pub success: bool,
    pub error: Option<String>,
}

impl UploadStatus {
    pub fn completed(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────

/// Request to stream a file back from the server's storage root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRequest {
    pub path: String,
}

/// Request to enumerate the files of a directory beneath the storage root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRequest {
    /// Relative directory; empty means the storage root itself.
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListResponse {
    pub files: Vec<String>,
}

/// Request to capture one monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScreenshotRequest {
    /// Monitor index to capture (0 = primary).
    pub monitor_index: u32,
}

/// Opening message of a push subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubscribeRequest {
    /// Free-form label the server uses in its logs.
    pub client_name: String,
}
