//! Notifications the server raises for collaborators (console, logs,
//! indexers). Delivered over an unbounded channel; a dropped receiver
//! silently disables them.

use tether_core::{ByteMessage, JsonEnvelope};

use crate::hub::{SubscriberId, SubscriptionKind};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client sent an envelope on the ack stream or the duplex stream.
    JsonReceived { peer: String, envelope: JsonEnvelope },
    BytesReceived { peer: String, message: ByteMessage },
    /// `path` is relative to the storage root.
    UploadCompleted { peer: String, path: String, size: u64 },
    UploadFailed { peer: String, path: Option<String>, error: String },
    SubscriberJoined { kind: SubscriptionKind, id: SubscriberId, label: String },
    SubscriberLeft { kind: SubscriptionKind, id: SubscriberId },
}
