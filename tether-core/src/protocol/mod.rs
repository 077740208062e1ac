//! Payload definitions carried inside Data frames.
//!
//! Each sub-module defines the request/response messages for one family
//! of RPCs. Payloads are serialized with `serde` + `bincode` and carried
//! inside [`Frame`] bodies.
//!
//! [`Frame`]: crate::packet::Frame

pub mod bytes;
pub mod call;
pub mod json;
pub mod transfer;

pub use self::bytes::{ByteAck, ByteMessage};
pub use call::{CallMetadata, Status, StatusCode};
pub use json::{JsonAck, JsonEnvelope, PROBE_TYPE, new_message_id};
pub use transfer::{
    DEFAULT_CHUNK_SIZE, DownloadRequest, ListRequest, ListResponse, ScreenshotRequest,
    SubscribeRequest, TransferChunk, UploadStatus,
};
