//! # tether-core
//!
//! Core library for the Tether streaming RPC transport.
//!
//! This crate contains:
//! - **Framing**: `FrameHeader`, `Frame`, `FrameKind`, `Method`, `FrameFlags`
//! - **Codec**: `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Protocol payloads**: JSON envelopes/acks, transfer chunks, byte messages, call status
//! - **Chunking**: `split`, `ChunkReader`, `ChunkAssembler` for large payloads
//! - **Network**: multiplexed `Channel`, `Connector` seam, reference-counted `ChannelPool`
//! - **Auth**: `AuthGuard` gate and `CredentialVault` for the shared secret
//! - **Config / logging**: `AppConfig` JSON document, tracing bootstrap with file rotation
//! - **State**: `ConnectionState` machine driven by the reconnect supervisor
//! - **Error**: `TetherError`, a typed, `thiserror`-based error hierarchy

pub mod auth;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod flags;
pub mod header;
pub mod logging;
pub mod message;
pub mod network;
pub mod packet;
pub mod protocol;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use auth::{AUTH_HEADER, AuthGuard, CredentialVault, Secret};
pub use chunk::{Assembled, ChunkAssembler, ChunkReader};
pub use codec::FrameCodec;
pub use config::AppConfig;
pub use error::TetherError;
pub use flags::FrameFlags;
pub use header::{FrameHeader, HEADER_SIZE};
pub use message::{FrameKind, Method};
pub use network::{
    CallStream, Channel, ChannelPool, Connector, EndpointIdentity, IncomingCall, PoolConfig,
    StreamReceiver, StreamSender, TcpConnector,
};
pub use packet::{Frame, MAX_CHUNK_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use protocol::{
    ByteAck, ByteMessage, CallMetadata, DownloadRequest, JsonAck, JsonEnvelope, ListRequest,
    ListResponse, ScreenshotRequest, Status, StatusCode, SubscribeRequest, TransferChunk,
    UploadStatus,
};
pub use state::ConnectionState;
