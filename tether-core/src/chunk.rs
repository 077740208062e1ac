//! Chunked transfer codec.
//!
//! Splits a payload into an ordered sequence of [`TransferChunk`]s and
//! reassembles it on the other side. Every large-payload operation uses
//! it: upload, download, screenshot retrieval and file broadcast.
//!
//! - `total_chunks = ceil(len / chunk_size)`, but never less than one: an
//!   empty payload is a single zero-length chunk with `is_last = true`.
//! - `index` runs `0..total_chunks`; only the final chunk has `is_last`.
//! - Chunk sizes are clamped to `1..=MAX_CHUNK_SIZE` (4 MiB) before use,
//!   so the count above is computed from the clamped size.
//! - Reassembly is keyed by the chunk `path`. One transfer per path may be
//!   in flight on a stream at a time.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::TetherError;
use crate::packet::MAX_CHUNK_SIZE;
use crate::protocol::transfer::TransferChunk;

/// Number of chunks needed for `len` bytes.
pub fn total_chunks(len: u64, chunk_size: usize) -> u32 {
    let chunk_size = chunk_size.max(1) as u64;
    len.div_ceil(chunk_size).max(1) as u32
}

/// Progress after `received` of `total` chunks, clamped to 100.
pub fn progress_percent(received: u32, total: u32) -> u8 {
    let total = total.max(1) as u64;
    (received as u64 * 100 / total).min(100) as u8
}

/// Clamp a configured chunk size into the range the framing accepts.
pub fn clamp_chunk_size(chunk_size: usize) -> usize {
    chunk_size.clamp(1, MAX_CHUNK_SIZE)
}

/// Split an in-memory payload into its chunk sequence.
///
/// `chunk_size` goes through [`clamp_chunk_size`]; a request above
/// `MAX_CHUNK_SIZE` yields chunks of exactly `MAX_CHUNK_SIZE`.
pub fn split(path: &str, data: &[u8], chunk_size: usize) -> Vec<TransferChunk> {
    let chunk_size = clamp_chunk_size(chunk_size);
    let total = total_chunks(data.len() as u64, chunk_size);
    if data.is_empty() {
        return vec![TransferChunk {
            path: path.to_string(),
            data: Vec::new(),
            index: 0,
            total_chunks: 1,
            is_last: true,
            error: None,
        }];
    }
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, slice)| TransferChunk {
            path: path.to_string(),
            data: slice.to_vec(),
            index: i as u32,
            total_chunks: total,
            is_last: i as u32 + 1 == total,
            error: None,
        })
        .collect()
}

// ── ChunkReader ──────────────────────────────────────────────────

/// Lazily chunks an async byte source of known length.
///
/// Used for file uploads and downloads so the whole file never has to be
/// held in memory.
pub struct ChunkReader<R> {
    reader: R,
    path: String,
    chunk_size: usize,
    total: u32,
    next_index: u32,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// `chunk_size` is clamped like in [`split`].
    pub fn new(reader: R, path: impl Into<String>, len: u64, chunk_size: usize) -> Self {
        let chunk_size = clamp_chunk_size(chunk_size);
        Self {
            reader,
            path: path.into(),
            chunk_size,
            total: total_chunks(len, chunk_size),
            next_index: 0,
            remaining: len,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    /// Read the next chunk, or `None` once the final chunk was produced.
    pub async fn next_chunk(&mut self) -> Result<Option<TransferChunk>, TetherError> {
        if self.next_index >= self.total {
            return Ok(None);
        }
        let want = self.remaining.min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; want];
        self.reader.read_exact(&mut data).await?;
        self.remaining -= want as u64;

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(TransferChunk {
            path: self.path.clone(),
            data,
            index,
            total_chunks: self.total,
            is_last: self.next_index == self.total,
            error: None,
        }))
    }
}

// ── ChunkAssembler ───────────────────────────────────────────────

/// Result of feeding one chunk into a [`ChunkAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// More chunks are expected for `path`.
    Progress {
        path: String,
        received: u32,
        total: u32,
        percent: u8,
    },
    /// `path` is complete.
    Complete { path: String, data: Bytes },
    /// The transfer for `path` was aborted; nothing was produced.
    Failed { path: String, error: String },
}

impl Assembled {
    pub fn path(&self) -> &str {
        match self {
            Assembled::Progress { path, .. }
            | Assembled::Complete { path, .. }
            | Assembled::Failed { path, .. } => path,
        }
    }

    /// Progress after this chunk (100 once complete).
    pub fn percent(&self) -> Option<u8> {
        match self {
            Assembled::Progress { percent, .. } => Some(*percent),
            Assembled::Complete { .. } => Some(100),
            Assembled::Failed { .. } => None,
        }
    }
}

#[derive(Debug)]
struct PartialTransfer {
    buffer: BytesMut,
    received: u32,
}

/// Accumulates chunk groups keyed by their path.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    transfers: HashMap<String, PartialTransfer>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers still waiting for their last chunk.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    pub fn accept(&mut self, chunk: TransferChunk) -> Assembled {
        let TransferChunk {
            path,
            data,
            index,
            total_chunks,
            is_last,
            error,
        } = chunk;

        if let Some(error) = error {
            if self.transfers.remove(&path).is_some() {
                debug!(%path, "transfer aborted by sender");
            }
            return Assembled::Failed { path, error };
        }

        if index == 0 && self.transfers.contains_key(&path) {
            warn!(%path, "new transfer started before the previous one finished; discarding partial data");
            self.transfers.remove(&path);
        }

        let entry = self
            .transfers
            .entry(path.clone())
            .or_insert_with(|| PartialTransfer {
                buffer: BytesMut::new(),
                received: 0,
            });

        if index != entry.received {
            let expected = entry.received;
            self.transfers.remove(&path);
            return Assembled::Failed {
                path,
                error: format!("chunk {index} arrived out of order (expected {expected})"),
            };
        }

        entry.buffer.extend_from_slice(&data);
        entry.received += 1;

        if is_last {
            let done = self.transfers.remove(&path);
            let data = done.map(|t| t.buffer.freeze()).unwrap_or_default();
            return Assembled::Complete { path, data };
        }

        Assembled::Progress {
            percent: progress_percent(entry.received, total_chunks),
            received: entry.received,
            total: total_chunks,
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: Vec<TransferChunk>) -> (Bytes, Vec<u8>) {
        let mut assembler = ChunkAssembler::new();
        let mut percents = Vec::new();
        for chunk in chunks {
            let outcome = assembler.accept(chunk);
            percents.extend(outcome.percent());
            if let Assembled::Complete { data, .. } = outcome {
                return (data, percents);
            }
        }
        panic!("transfer never completed");
    }

    #[test]
    fn total_chunks_rounds_up_and_never_zero() {
        assert_eq!(total_chunks(0, 65536), 1);
        assert_eq!(total_chunks(1, 65536), 1);
        assert_eq!(total_chunks(65536, 65536), 1);
        assert_eq!(total_chunks(65537, 65536), 2);
        assert_eq!(total_chunks(250 * 1024, 64 * 1024), 4);
    }

    #[test]
    fn oversized_chunk_size_falls_back_to_the_frame_limit() {
        let data = vec![7u8; MAX_CHUNK_SIZE + 10];
        let chunks = split("big.bin", &data, MAX_CHUNK_SIZE * 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data.len(), MAX_CHUNK_SIZE);
        assert_eq!(chunks[1].data.len(), 10);
        assert_eq!(chunks[0].total_chunks, total_chunks(data.len() as u64, MAX_CHUNK_SIZE));
    }

    #[test]
    fn split_marks_exactly_one_last_chunk() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        for chunk_size in [1usize, 7, 100, 999, 1000, 4096] {
            let chunks = split("f.bin", &data, chunk_size);
            assert_eq!(chunks.len() as u32, total_chunks(1000, chunk_size));
            assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
            assert!(chunks.last().unwrap().is_last);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i as u32);
            }
            let (back, _) = reassemble(chunks);
            assert_eq!(&back[..], &data[..]);
        }
    }

    #[test]
    fn empty_payload_is_one_observable_chunk() {
        let chunks = split("empty.txt", &[], 64);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert_eq!(chunks[0].total_chunks, 1);
        let (back, percents) = reassemble(chunks);
        assert!(back.is_empty());
        assert_eq!(percents, vec![100]);
    }

    #[test]
    fn progress_reaches_quarters() {
        let data = vec![7u8; 250 * 1024];
        let (_, percents) = reassemble(split("big.bin", &data, 64 * 1024));
        assert_eq!(percents, vec![25, 50, 75, 100]);
    }

    #[test]
    fn error_chunk_aborts_accumulation() {
        let mut assembler = ChunkAssembler::new();
        let mut chunks = split("x.bin", &[1u8; 300], 100);
        assert!(matches!(
            assembler.accept(chunks.remove(0)),
            Assembled::Progress { .. }
        ));
        assert_eq!(assembler.in_flight(), 1);

        let outcome = assembler.accept(TransferChunk::failed("x.bin", "disk gone"));
        assert_eq!(
            outcome,
            Assembled::Failed {
                path: "x.bin".into(),
                error: "disk gone".into()
            }
        );
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn out_of_order_chunk_fails_transfer() {
        let mut assembler = ChunkAssembler::new();
        let chunks = split("y.bin", &[1u8; 300], 100);
        assembler.accept(chunks[0].clone());
        let outcome = assembler.accept(chunks[2].clone());
        assert!(matches!(outcome, Assembled::Failed { .. }));
    }

    #[test]
    fn distinct_paths_accumulate_independently() {
        let mut assembler = ChunkAssembler::new();
        let a = split("a", b"aaaa", 2);
        let b = split("b", b"bb", 1);
        assembler.accept(a[0].clone());
        assembler.accept(b[0].clone());
        assert_eq!(assembler.in_flight(), 2);
        assert_eq!(
            assembler.accept(a[1].clone()),
            Assembled::Complete {
                path: "a".into(),
                data: Bytes::from_static(b"aaaa")
            }
        );
        assert!(matches!(assembler.accept(b[1].clone()), Assembled::Complete { .. }));
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(progress_percent(5, 4), 100);
        assert_eq!(progress_percent(1, 0), 100);
        assert_eq!(progress_percent(1, 3), 33);
    }

    #[tokio::test]
    async fn chunk_reader_matches_split() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let mut reader = ChunkReader::new(&data[..], "r.bin", data.len() as u64, 4096);
        assert_eq!(reader.total_chunks(), 3);

        let mut produced = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            produced.push(chunk);
        }
        assert_eq!(produced, split("r.bin", &data, 4096));
    }

    #[tokio::test]
    async fn chunk_reader_empty_source() {
        let mut reader = ChunkReader::new(&[][..], "e", 0, 16);
        let first = reader.next_chunk().await.unwrap().unwrap();
        assert!(first.is_last && first.data.is_empty());
        assert!(reader.next_chunk().await.unwrap().is_none());
    }
}
