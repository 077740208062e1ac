//! Fixed-size frame header.

use crate::error::TetherError;
use crate::flags::FrameFlags;
use crate::message::FrameKind;

/// Encoded header length on the wire.
pub const HEADER_SIZE: usize = 40;

const MAGIC: [u8; 4] = *b"TTH1";

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

/// Header prepended to every frame (little endian).
///
/// ```text
/// magic:          u32  (4)   "TTH1"
/// checksum:       u32  (4)   blake3(payload)[0..4]
/// kind:           u32  (4)
/// flags:          u32  (4)
/// method:         u64  (8)
/// stream_id:      u64  (8)
/// payload_length: u64  (8)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    checksum: u32,
    kind: FrameKind,
    flags: FrameFlags,
    method: u64,
    stream_id: u64,
    payload_length: u64,
}

impl FrameHeader {
    pub fn new(
        kind: FrameKind,
        flags: FrameFlags,
        method: u64,
        stream_id: u64,
        payload_length: u64,
    ) -> Self {
        Self {
            checksum: 0,
            kind,
            flags,
            method,
            stream_id,
            payload_length,
        }
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut buf: FrameHeaderBytes = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[16..24].copy_from_slice(&self.method.to_le_bytes());
        buf[24..32].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, TetherError> {
        if bytes[0..4] != MAGIC {
            return Err(TetherError::InvalidMagic);
        }
        let kind = FrameKind::try_from(read_u32(bytes, 8))?;
        let flags = FrameFlags::from_bits(read_u32(bytes, 12))
            .ok_or(TetherError::InvalidHeader("unknown flag bits"))?;
        Ok(Self {
            checksum: read_u32(bytes, 4),
            kind,
            flags,
            method: read_u64(bytes, 16),
            stream_id: read_u64(bytes, 24),
            payload_length: read_u64(bytes, 32),
        })
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn set_checksum(&mut self, checksum: u32) {
        self.checksum = checksum;
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn method(&self) -> u64 {
        self.method
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn payload_length(&self) -> u64 {
        self.payload_length
    }
}

fn read_u32(bytes: &FrameHeaderBytes, at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(bytes: &FrameHeaderBytes, at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}
