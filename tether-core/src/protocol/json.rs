//! JSON messaging: envelopes and their acknowledgments.
//!
//! # Wire Protocol
//!
//! ## Ack-correlated stream (`JsonStream`)
//! ```text
//! Client ──[Data: JsonEnvelope]─────────────► Server   (repeated)
//! Server ──[Data: JsonAck]──────────────────► Client   (one per envelope, same id)
//! ```
//!
//! ## Duplex push (`JsonDuplex`)
//! ```text
//! Client ──[Data: JsonEnvelope]─────────────► Server   (logged, never acked)
//! Server ──[Data: JsonEnvelope]─────────────► Client   (broadcast, any time)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope type used by the post-connect round-trip probe.
pub const PROBE_TYPE: &str = "tether.probe";

/// One JSON message unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonEnvelope {
    /// Correlation id, unique within a session.
    pub id: String,

    /// Application-defined type tag.
    pub kind: String,

    /// The JSON document, as text.
    pub json: String,

    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl JsonEnvelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(kind: impl Into<String>, json: impl Into<String>) -> Self {
        Self::with_id(new_message_id(), kind, json)
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            json: json.into(),
            timestamp_ms: now_ms(),
        }
    }

    /// The trivial envelope a client uses to confirm the link round-trips.
    pub fn probe() -> Self {
        Self::new(PROBE_TYPE, "{}")
    }

    pub fn is_probe(&self) -> bool {
        self.kind == PROBE_TYPE
    }

    /// Parse the embedded document.
    pub fn parse(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.json)
    }
}

/// Acknowledgment of one [`JsonEnvelope`], matched by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonAck {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl JsonAck {
    pub fn success(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// A fresh message id (random UUID v4).
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
