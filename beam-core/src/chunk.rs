//! Chunk manager: split a file into fixed-size chunks, encode/decode chunk
//! payloads, and track which chunks of an incoming file have been written.

use std::io::{Seek, SeekFrom, Write};

use crate::progress::ProgressTracker;

/// Chunk size in bytes; sender and receiver must agree.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024; // 256 KiB

/// Most chunks one transfer may announce (1 TiB at the default chunk size).
/// Bounds the per-transfer completion mask a peer can make us allocate.
pub const MAX_CHUNKS: u32 = 1 << 22;

/// Fixed part of a chunk payload: index (4) + total (4) + name length (2).
const CHUNK_PREFIX_LEN: usize = 4 + 4 + 2;

/// One chunk of a file: its index and byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Number of chunks a file of `total_len` bytes is sent as. An empty file is one empty chunk.
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u64 {
    let size = effective_chunk_size(chunk_size);
    total_len.div_ceil(size).max(1)
}

fn effective_chunk_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// Split a file into chunks by fixed size. Always yields at least one range.
pub fn split_into_chunks(total_len: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let size = effective_chunk_size(chunk_size);
    if total_len == 0 {
        return vec![ChunkRange {
            index: 0,
            start: 0,
            end: 0,
        }];
    }
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut index = 0u32;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { index, start, end });
        start = end;
        index += 1;
    }
    out
}

/// Addressing fields in front of every chunk's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: u32,
    pub total: u32,
    pub name: String,
}

/// Encode `chunkIndex:int32, totalChunks:int32, nameLen:int16, name, bytes`.
pub fn encode_chunk(header: &ChunkHeader, data: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let index = i32::try_from(header.index).map_err(|_| ChunkError::TooManyChunks)?;
    let total = i32::try_from(header.total).map_err(|_| ChunkError::TooManyChunks)?;
    let name_len = i16::try_from(header.name.len()).map_err(|_| ChunkError::NameTooLong)?;
    let mut out = Vec::with_capacity(CHUNK_PREFIX_LEN + header.name.len() + data.len());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&name_len.to_be_bytes());
    out.extend_from_slice(header.name.as_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Decode a chunk payload into its header and data bytes.
pub fn decode_chunk(payload: &[u8]) -> Result<(ChunkHeader, &[u8]), ChunkError> {
    if payload.len() < CHUNK_PREFIX_LEN {
        return Err(ChunkError::Truncated);
    }
    let index = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let total = i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let name_len = i16::from_be_bytes([payload[8], payload[9]]);
    let index = u32::try_from(index).map_err(|_| ChunkError::Malformed("negative chunk index"))?;
    let total = u32::try_from(total).map_err(|_| ChunkError::Malformed("negative chunk total"))?;
    let name_len =
        usize::try_from(name_len).map_err(|_| ChunkError::Malformed("negative name length"))?;
    let name_end = CHUNK_PREFIX_LEN + name_len;
    if payload.len() < name_end {
        return Err(ChunkError::Truncated);
    }
    let name = std::str::from_utf8(&payload[CHUNK_PREFIX_LEN..name_end])
        .map_err(|_| ChunkError::Malformed("file name is not UTF-8"))?
        .to_string();
    Ok((ChunkHeader { index, total, name }, &payload[name_end..]))
}

/// Receiver-side state of one chunked file: completion mask, counter, progress.
/// Holds no file handle; the caller writes at the offset `begin` hands out and
/// then calls `commit`, so a bit is only set once its bytes are on disk.
#[derive(Debug)]
pub struct TransferState {
    file_name: String,
    total_chunks: u32,
    received_chunks: u32,
    mask: Vec<bool>,
    chunk_size: u64,
    progress: ProgressTracker,
}

impl TransferState {
    /// `total_chunks` is fixed here from the first chunk that arrives.
    pub fn new(
        file_name: impl Into<String>,
        total_chunks: u32,
        chunk_size: u64,
    ) -> Result<Self, ChunkError> {
        if total_chunks == 0 {
            return Err(ChunkError::EmptyTransfer);
        }
        if total_chunks > MAX_CHUNKS {
            return Err(ChunkError::TooManyChunks);
        }
        Ok(Self {
            file_name: file_name.into(),
            total_chunks,
            received_chunks: 0,
            mask: vec![false; total_chunks as usize],
            chunk_size: effective_chunk_size(chunk_size),
            progress: ProgressTracker::new(),
        })
    }

    /// Validate a chunk and return the file offset to write it at,
    /// or `None` if this chunk was already written.
    pub fn begin(&self, header: &ChunkHeader, data_len: usize) -> Result<Option<u64>, ChunkError> {
        if header.total != self.total_chunks {
            return Err(ChunkError::TotalMismatch {
                expected: self.total_chunks,
                got: header.total,
            });
        }
        if header.index >= self.total_chunks {
            return Err(ChunkError::IndexOutOfRange {
                index: header.index,
                total: self.total_chunks,
            });
        }
        if data_len as u64 > self.chunk_size {
            return Err(ChunkError::ChunkTooLarge(data_len));
        }
        if self.mask[header.index as usize] {
            return Ok(None);
        }
        Ok(Some(u64::from(header.index) * self.chunk_size))
    }

    /// Record that chunk `index` has been written.
    pub fn commit(&mut self, index: u32) -> ChunkReceiveResult {
        let Some(bit) = self.mask.get_mut(index as usize) else {
            return ChunkReceiveResult::Duplicate;
        };
        if *bit {
            return ChunkReceiveResult::Duplicate;
        }
        *bit = true;
        self.received_chunks += 1;
        let progress = self
            .progress
            .update(u64::from(self.received_chunks), u64::from(self.total_chunks));
        if self.is_complete() {
            ChunkReceiveResult::Complete { progress }
        } else {
            ChunkReceiveResult::InProgress { progress }
        }
    }

    /// `begin` + positional write + `commit` against any seekable writer.
    pub fn write_chunk<W: Write + Seek>(
        &mut self,
        out: &mut W,
        header: &ChunkHeader,
        data: &[u8],
    ) -> Result<ChunkReceiveResult, ChunkError> {
        let Some(offset) = self.begin(header, data.len())? else {
            return Ok(ChunkReceiveResult::Duplicate);
        };
        out.seek(SeekFrom::Start(offset))?;
        out.write_all(data)?;
        Ok(self.commit(header.index))
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.mask.get(index as usize).copied().unwrap_or(false)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }
}

/// Result of processing one received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk already written; nothing changed.
    Duplicate,
    /// Chunk stored; `progress` is set when the whole percentage changed.
    InProgress { progress: Option<u8> },
    /// Last missing chunk stored; the file is ready to be finalized.
    Complete { progress: Option<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk payload truncated")]
    Truncated,
    #[error("malformed chunk: {0}")]
    Malformed(&'static str),
    #[error("file name too long")]
    NameTooLong,
    #[error("too many chunks")]
    TooManyChunks,
    #[error("transfer announces zero chunks")]
    EmptyTransfer,
    #[error("chunk {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk total changed mid-transfer: expected {expected}, got {got}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("chunk of {0} bytes exceeds chunk size")]
    ChunkTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn header(index: u32, total: u32) -> ChunkHeader {
        ChunkHeader {
            index,
            total,
            name: "f.bin".into(),
        }
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 30);
        assert_eq!(chunks[3].index, 3);
        assert_eq!(chunks[3].start, 90);
        assert_eq!(chunks[3].end, 100);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_zero_length_is_one_empty_chunk() {
        let chunks = split_into_chunks(0, 30);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        assert_eq!(chunk_count(0, 30), 1);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(DEFAULT_CHUNK_SIZE * 2, 0);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn ten_mib_is_forty_chunks() {
        let total = 10 * 1024 * 1024;
        assert_eq!(chunk_count(total, DEFAULT_CHUNK_SIZE), 40);
        let chunks = split_into_chunks(total, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 40);
        assert!(chunks.iter().all(|c| c.len() == DEFAULT_CHUNK_SIZE));
    }

    #[test]
    fn chunk_payload_layout() {
        let h = ChunkHeader {
            index: 3,
            total: 7,
            name: "ab".into(),
        };
        let bytes = encode_chunk(&h, &[9, 9]).unwrap();
        assert_eq!(&bytes[0..4], &3i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_be_bytes());
        assert_eq!(&bytes[8..10], &2i16.to_be_bytes());
        assert_eq!(&bytes[10..12], b"ab");
        let (decoded, data) = decode_chunk(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(data, &[9, 9]);
    }

    #[test]
    fn decode_rejects_short_and_negative() {
        assert!(matches!(decode_chunk(&[0; 5]), Err(ChunkError::Truncated)));
        let mut bad = Vec::new();
        bad.extend_from_slice(&(-1i32).to_be_bytes());
        bad.extend_from_slice(&1i32.to_be_bytes());
        bad.extend_from_slice(&0i16.to_be_bytes());
        assert!(matches!(decode_chunk(&bad), Err(ChunkError::Malformed(_))));
        let mut long_name = Vec::new();
        long_name.extend_from_slice(&0i32.to_be_bytes());
        long_name.extend_from_slice(&1i32.to_be_bytes());
        long_name.extend_from_slice(&40i16.to_be_bytes());
        long_name.extend_from_slice(b"abc");
        assert!(matches!(decode_chunk(&long_name), Err(ChunkError::Truncated)));
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut state = TransferState::new("f.bin", 2, 4).unwrap();
        let mut out = Cursor::new(Vec::new());
        let r = state.write_chunk(&mut out, &header(0, 2), b"abcd").unwrap();
        assert_eq!(r, ChunkReceiveResult::InProgress { progress: Some(50) });

        // Same index again with different bytes: nothing written, nothing counted.
        let r2 = state.write_chunk(&mut out, &header(0, 2), b"zzzz").unwrap();
        assert_eq!(r2, ChunkReceiveResult::Duplicate);
        assert_eq!(state.received_chunks(), 1);
        assert_eq!(out.get_ref().as_slice(), b"abcd");
    }

    #[test]
    fn out_of_order_reassembly_any_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let chunk_size = 16u64;
        for round in 0..25 {
            let len: usize = rng.gen_range(1..200);
            let source: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut chunks = split_into_chunks(len as u64, chunk_size);
            let total = chunks.len() as u32;
            chunks.shuffle(&mut rng);

            let mut state = TransferState::new("f.bin", total, chunk_size).unwrap();
            let mut out = Cursor::new(Vec::new());
            let mut completions = 0;
            for c in &chunks {
                let data = &source[c.start as usize..c.end as usize];
                match state.write_chunk(&mut out, &header(c.index, total), data).unwrap() {
                    ChunkReceiveResult::Complete { .. } => completions += 1,
                    ChunkReceiveResult::InProgress { .. } => {}
                    ChunkReceiveResult::Duplicate => panic!("round {round}: unexpected duplicate"),
                }
            }
            assert_eq!(completions, 1, "round {round}");
            assert_eq!(out.into_inner(), source, "round {round}");
        }
    }

    #[test]
    fn progress_reaches_hundred_once_for_forty_chunks() {
        let mut state = TransferState::new("big.bin", 40, DEFAULT_CHUNK_SIZE).unwrap();
        let mut reported = Vec::new();
        for i in 0..40 {
            let (ChunkReceiveResult::InProgress { progress } | ChunkReceiveResult::Complete { progress }) =
                state.commit(i)
            else {
                panic!("chunk {i} reported as duplicate");
            };
            reported.extend(progress);
        }
        // Re-delivering the last chunk must not produce another 100.
        assert_eq!(state.commit(39), ChunkReceiveResult::Duplicate);
        assert_eq!(reported.iter().filter(|p| **p == 100).count(), 1);
        assert_eq!(reported.len(), 40);
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rejects_out_of_range_and_total_change() {
        let state = TransferState::new("f.bin", 2, 4).unwrap();
        assert!(matches!(
            state.begin(&header(2, 2), 1),
            Err(ChunkError::IndexOutOfRange { index: 2, total: 2 })
        ));
        assert!(matches!(
            state.begin(&header(0, 3), 1),
            Err(ChunkError::TotalMismatch {
                expected: 2,
                got: 3
            })
        ));
        assert!(matches!(
            state.begin(&header(0, 2), 5),
            Err(ChunkError::ChunkTooLarge(5))
        ));
    }

    #[test]
    fn zero_total_rejected() {
        assert!(matches!(
            TransferState::new("f.bin", 0, 4),
            Err(ChunkError::EmptyTransfer)
        ));
    }

    #[test]
    fn oversized_total_rejected_before_allocating() {
        assert!(matches!(
            TransferState::new("f.bin", i32::MAX as u32, DEFAULT_CHUNK_SIZE),
            Err(ChunkError::TooManyChunks)
        ));
        assert!(matches!(
            TransferState::new("f.bin", MAX_CHUNKS + 1, DEFAULT_CHUNK_SIZE),
            Err(ChunkError::TooManyChunks)
        ));
        let state = TransferState::new("f.bin", MAX_CHUNKS, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(state.total_chunks(), MAX_CHUNKS);
    }

    #[test]
    fn empty_file_completes_with_single_empty_chunk() {
        let mut state = TransferState::new("empty", 1, DEFAULT_CHUNK_SIZE).unwrap();
        let mut out = Cursor::new(Vec::new());
        let r = state.write_chunk(&mut out, &header(0, 1), &[]).unwrap();
        assert_eq!(r, ChunkReceiveResult::Complete { progress: Some(100) });
        assert!(out.into_inner().is_empty());
    }
}
