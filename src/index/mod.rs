//! In-memory range index over a source's chunks
//!
//! Built once per source from its chunk records and shared read-only across
//! requests. Point lookups binary-search a sorted array of chunk start
//! offsets, then check the candidate's end so gaps and out-of-range points
//! report nothing instead of a neighbouring chunk.

use crate::error::{Error, Result};
use crate::metadata::{ChunkRecord, OffsetUnit};

/// Sorted interval index over one source's chunks
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    unit: OffsetUnit,
    /// `starts[i] == chunks[i].start`, strictly increasing
    starts: Vec<u64>,
    chunks: Vec<ChunkRecord>,
}

impl ChunkIndex {
    /// Build the index from a source's chunk records (any order)
    pub fn build(mut chunks: Vec<ChunkRecord>) -> Result<Self> {
        let first = chunks
            .first()
            .ok_or_else(|| Error::NotFound("source has no chunks".to_string()))?;
        let unit = first.unit;

        chunks.sort_by_key(|c| c.order);

        for chunk in &chunks {
            if chunk.unit != unit {
                return Err(Error::Internal(format!(
                    "chunk {} uses {} offsets, expected {}",
                    chunk.order, chunk.unit, unit
                )));
            }
            if chunk.start > chunk.end {
                return Err(Error::Internal(format!(
                    "chunk {} has start {} past end {}",
                    chunk.order, chunk.start, chunk.end
                )));
            }
        }

        for pair in chunks.windows(2) {
            if pair[1].start <= pair[0].end {
                return Err(Error::Internal(format!(
                    "chunks {} and {} overlap",
                    pair[0].order, pair[1].order
                )));
            }
        }

        let starts = chunks.iter().map(|c| c.start).collect();
        Ok(ChunkIndex {
            unit,
            starts,
            chunks,
        })
    }

    /// Offset unit shared by every chunk
    pub fn unit(&self) -> OffsetUnit {
        self.unit
    }

    /// One past the last covered offset
    pub fn total(&self) -> u64 {
        self.chunks.last().map(|c| c.end + 1).unwrap_or(0)
    }

    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All chunks in order
    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    /// Whether the chunks cover `[0, total)` without holes
    pub fn is_gapless(&self) -> bool {
        self.starts.first() == Some(&0)
            && self.chunks.windows(2).all(|w| w[0].end + 1 == w[1].start)
    }

    /// Position of the chunk containing `point`
    fn position(&self, point: u64) -> Option<usize> {
        // Number of chunks starting at or before `point`
        let idx = self.starts.partition_point(|&start| start <= point);
        let candidate = idx.checked_sub(1)?;
        self.chunks[candidate].contains(point).then_some(candidate)
    }

    /// The chunk that owns `point`, if any
    pub fn lookup(&self, point: u64) -> Option<&ChunkRecord> {
        self.position(point).map(|idx| &self.chunks[idx])
    }

    /// The contiguous run of chunks covering `[start, end]`
    pub fn span(&self, start: u64, end: u64) -> Result<&[ChunkRecord]> {
        if start > end {
            return Err(Error::RangeNotSatisfiable(format!(
                "start {} is past end {}",
                start, end
            )));
        }

        let first = self.position(start).ok_or_else(|| {
            Error::RangeNotSatisfiable(format!("offset {} is not covered by any chunk", start))
        })?;
        let last = self.position(end).ok_or_else(|| {
            Error::RangeNotSatisfiable(format!("offset {} is not covered by any chunk", end))
        })?;

        let run = &self.chunks[first..=last];
        if run.windows(2).any(|w| w[0].end + 1 != w[1].start) {
            return Err(Error::RangeNotSatisfiable(format!(
                "range {}-{} crosses a gap between chunks",
                start, end
            )));
        }
        Ok(run)
    }
}
