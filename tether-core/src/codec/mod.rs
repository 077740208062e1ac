//! Length-prefixed frame codec for `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TetherError;
use crate::header::{FrameHeader, FrameHeaderBytes, HEADER_SIZE};
use crate::packet::{Frame, MAX_PAYLOAD_SIZE};

/// Splits a byte stream into [`Frame`]s and back.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header of the frame whose payload is still arriving.
    pending: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut header_bytes: FrameHeaderBytes = [0; HEADER_SIZE];
                header_bytes.copy_from_slice(&src[..HEADER_SIZE]);
                let header = FrameHeader::from_bytes(&header_bytes)?;

                // Refuse before buffering a hostile length.
                let len = header.payload_length() as usize;
                if len > MAX_PAYLOAD_SIZE {
                    return Err(TetherError::PayloadTooLarge {
                        size: len,
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                src.advance(HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let len = header.payload_length() as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        Frame::from_parts(header, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TetherError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_SIZE + item.payload().len());
        dst.put_slice(&item.header().to_bytes());
        dst.put_slice(item.payload());
        Ok(())
    }
}
