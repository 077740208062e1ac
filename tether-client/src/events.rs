//! Events a session raises for its consumer.

use std::fmt;
use std::path::PathBuf;

use tether_core::{ByteMessage, JsonEnvelope};

/// Which transfer a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
    Screenshot,
    /// A file pushed by a server broadcast.
    Broadcast,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
            Direction::Screenshot => write!(f, "screenshot"),
            Direction::Broadcast => write!(f, "broadcast"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An envelope pushed on the duplex stream.
    JsonReceived(JsonEnvelope),
    BytesReceived(ByteMessage),
    /// A broadcast file finished. `saved_to` is set when it was written to
    /// the download directory.
    FileReceived {
        name: String,
        size: u64,
        saved_to: Option<PathBuf>,
    },
    FileFailed { name: String, error: String },
    Progress {
        direction: Direction,
        name: String,
        percent: u8,
    },
    /// Raised at most once per session.
    ConnectionLost { reason: String },
}
