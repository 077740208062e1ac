//! Byte messages: opaque binary payloads with a type tag.
//!
//! ```text
//! Client ──[Open SendBytes]──[Data: ByteMessage, END_STREAM]► Server
//! Server ──[Data: ByteAck]──[Status Ok]─────────────────────► Client
//!
//! Client ──[Open SubscribeBytes]────────────► Server
//! Server ──[Data: ByteMessage]──────────────► Client   (broadcast, any time)
//! ```

use serde::{Deserialize, Serialize};

use crate::protocol::json::new_message_id;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteMessage {
    pub id: String,
    pub kind: String,
    pub data: Vec<u8>,
    /// Free-form metadata, typically a small JSON document.
    pub metadata: String,
}

impl ByteMessage {
    pub fn new(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: new_message_id(),
            kind: kind.into(),
            data,
            metadata: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Acknowledgment of an acked byte send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteAck {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ByteAck {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
        }
    }
}
