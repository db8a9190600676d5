//! Fixed-size byte chunking
//!
//! Chunk *i* (0-based) covers `[i*cs, min((i+1)*cs, size) - 1]`. Works for
//! any byte stream; chunks are plain slices of the original, so their
//! `payload_offset` is 0.

use super::{chunk_extension, Partitioned, Partitioner};
use crate::error::{Error, Result};
use crate::metadata::{ChunkDraft, OffsetUnit, SourceFile};
use crate::storage::AttemptDir;
use std::fs::File;
use std::os::unix::fs::FileExt;
use tracing::debug;

/// Copy buffer size
const COPY_BUFFER: u64 = 64 * 1024;

/// Splits a file into fixed-size byte chunks
pub struct FixedSizePartitioner {
    chunk_size: u64,
}

impl FixedSizePartitioner {
    /// Create a partitioner with the given chunk size
    pub fn new(chunk_size: u64) -> Self {
        FixedSizePartitioner { chunk_size }
    }

    /// Get the configured chunk size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Inclusive byte spans of a file of `size` bytes
    pub fn spans(&self, size: u64) -> Vec<(u64, u64)> {
        let mut spans = Vec::new();
        let mut start = 0u64;
        while start < size {
            let end = (start + self.chunk_size).min(size) - 1;
            spans.push((start, end));
            start = end + 1;
        }
        spans
    }
}

/// Copy `[start, end]` of `file` into a new chunk file
pub(super) fn copy_span(
    file: &File,
    start: u64,
    end: u64,
    writer: &mut crate::storage::ChunkWriter,
) -> Result<()> {
    let mut buffer = vec![0u8; COPY_BUFFER as usize];
    let mut offset = start;

    while offset <= end {
        let n = (end - offset + 1).min(COPY_BUFFER) as usize;
        file.read_exact_at(&mut buffer[..n], offset)?;
        writer.write(&buffer[..n])?;
        offset += n as u64;
    }
    Ok(())
}

impl Partitioner for FixedSizePartitioner {
    fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be non-zero".to_string()));
        }

        let file = File::open(&source.path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Err(Error::InvalidFormat(format!("{} is empty", source.name)));
        }

        let ext = chunk_extension(source);
        let mut chunks = Vec::new();

        for (i, (start, end)) in self.spans(size).into_iter().enumerate() {
            let mut writer = out.create_chunk(i as u32 + 1, &ext)?;
            copy_span(&file, start, end, &mut writer)?;
            let written = writer.finish()?;

            chunks.push(ChunkDraft {
                storage_path: written.path,
                start,
                end,
                size: written.size,
                payload_offset: 0,
                content_hash: written.content_hash,
            });
        }

        debug!(
            "Split {} ({} bytes) into {} chunks of up to {} bytes",
            source.name,
            size,
            chunks.len(),
            self.chunk_size
        );

        Ok(Partitioned {
            chunks,
            unit: OffsetUnit::Bytes,
            extent: size,
        })
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
