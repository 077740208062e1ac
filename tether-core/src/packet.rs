//! A single frame: header plus payload.

use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;

use crate::error::TetherError;
use crate::flags::FrameFlags;
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};
use crate::message::{FrameKind, Method};
use crate::protocol::call::{CallMetadata, Status};

/// Largest chunk a transfer may carry.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Largest payload accepted in one frame (a maximal chunk plus envelope overhead).
pub const MAX_PAYLOAD_SIZE: usize = MAX_CHUNK_SIZE + 64 * 1024;

/// Largest frame accepted by the codec.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Clone)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    fn build(
        kind: FrameKind,
        flags: FrameFlags,
        method: u64,
        stream_id: u64,
        payload: Bytes,
    ) -> Result<Self, TetherError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TetherError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut flags = flags;
        if !payload.is_empty() {
            flags |= FrameFlags::CHECKSUM;
        }
        let mut header = FrameHeader::new(kind, flags, method, stream_id, payload.len() as u64);
        if !payload.is_empty() {
            header.set_checksum(checksum(&payload));
        }
        Ok(Self { header, payload })
    }

    pub fn heartbeat() -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Heartbeat, FrameFlags::empty(), 0, 0, 0),
            payload: Bytes::new(),
        }
    }

    /// Open a stream for `method`, carrying the call metadata.
    pub fn open(stream_id: u64, method: Method, metadata: &CallMetadata) -> Result<Self, TetherError> {
        let payload = bincode::serialize(metadata)?;
        Self::build(
            FrameKind::Open,
            FrameFlags::empty(),
            method as u64,
            stream_id,
            Bytes::from(payload),
        )
    }

    /// A message frame with an already-encoded payload.
    pub fn data(stream_id: u64, payload: Bytes, last: bool) -> Result<Self, TetherError> {
        let flags = if last {
            FrameFlags::END_STREAM
        } else {
            FrameFlags::empty()
        };
        Self::build(FrameKind::Data, flags, 0, stream_id, payload)
    }

    /// Encode `message` with bincode into a message frame.
    pub fn message<T: Serialize>(stream_id: u64, message: &T, last: bool) -> Result<Self, TetherError> {
        Self::data(stream_id, encode_message(message)?, last)
    }

    pub fn end(stream_id: u64) -> Self {
        Self {
            header: FrameHeader::new(FrameKind::End, FrameFlags::empty(), 0, stream_id, 0),
            payload: Bytes::new(),
        }
    }

    pub fn status(stream_id: u64, status: &Status) -> Result<Self, TetherError> {
        let payload = bincode::serialize(status)?;
        Self::build(
            FrameKind::Status,
            FrameFlags::empty(),
            0,
            stream_id,
            Bytes::from(payload),
        )
    }

    pub fn reset(stream_id: u64) -> Self {
        Self {
            header: FrameHeader::new(FrameKind::Reset, FrameFlags::empty(), 0, stream_id, 0),
            payload: Bytes::new(),
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind()
    }

    pub fn flags(&self) -> FrameFlags {
        self.header.flags()
    }

    pub fn stream_id(&self) -> u64 {
        self.header.stream_id()
    }

    pub fn method(&self) -> Result<Method, TetherError> {
        Method::try_from(self.header.method())
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_end_stream(&self) -> bool {
        self.header.flags().contains(FrameFlags::END_STREAM)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Rebuild a frame from a complete buffer (header and payload, nothing more).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TetherError> {
        if bytes.len() < HEADER_SIZE {
            return Err(TetherError::InvalidFrameLength {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut header_bytes: FrameHeaderBytes = [0; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes)?;

        let expected = HEADER_SIZE + header.payload_length() as usize;
        if bytes.len() != expected {
            return Err(TetherError::InvalidFrameLength {
                expected,
                actual: bytes.len(),
            });
        }
        Self::from_parts(header, Bytes::copy_from_slice(&bytes[HEADER_SIZE..]))
    }

    /// Assemble a frame from a decoded header and its payload, verifying
    /// the checksum when the header says one is present.
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Result<Self, TetherError> {
        if header.payload_length() as usize > MAX_PAYLOAD_SIZE {
            return Err(TetherError::PayloadTooLarge {
                size: header.payload_length() as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let frame = Self { header, payload };
        if !frame.validate() {
            return Err(TetherError::ChecksumMismatch);
        }
        Ok(frame)
    }

    /// Check the payload against the header checksum.
    pub fn validate(&self) -> bool {
        if !self.header.flags().contains(FrameFlags::CHECKSUM) {
            return self.payload.is_empty();
        }
        self.header.checksum() == checksum(&self.payload)
    }
}

/// Encode a payload message the way every Data frame carries it.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, TetherError> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let mut word = [0u8; 4];
    word.copy_from_slice(&hash.as_bytes()[0..4]);
    u32::from_le_bytes(word)
}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
