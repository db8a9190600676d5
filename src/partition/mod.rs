//! Source partitioning
//!
//! A partitioner splits one source file into ordered, contiguous chunk files
//! and describes each with a `ChunkDraft`. Which partitioner runs is chosen
//! by `PartitionPolicy`; `ChunkJob` drives them over batches of sources.

mod fixed;
mod flac;
mod job;
mod segment;

pub use fixed::FixedSizePartitioner;
pub use flac::{find_frame_starts, read_stream_header, FrameAlignedPartitioner};
pub use job::{BatchReport, ChunkJob};
pub use segment::{segment_spans, TimeSegmentPartitioner};

use crate::config::{ChunkConfig, PartitionPolicy};
use crate::error::Result;
use crate::metadata::{ChunkDraft, OffsetUnit, SourceFile};
use crate::storage::AttemptDir;

/// Chunks produced for one source, in order
#[derive(Debug)]
pub struct Partitioned {
    pub chunks: Vec<ChunkDraft>,
    pub unit: OffsetUnit,
    /// Total covered extent in `unit`
    pub extent: u64,
}

/// Splits a source file into chunk files
pub trait Partitioner: Send + Sync {
    /// Write all chunk files of `source` into `out`.
    ///
    /// Every returned chunk file is complete and synced to disk.
    fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Build the partitioner selected by configuration
pub fn from_config(config: &ChunkConfig) -> Box<dyn Partitioner> {
    match &config.policy {
        PartitionPolicy::FixedSize { chunk_size } => {
            Box::new(FixedSizePartitioner::new(*chunk_size))
        }
        PartitionPolicy::TimeSegments { segment_secs } => Box::new(TimeSegmentPartitioner::new(
            *segment_secs,
            config.ffmpeg_bin.clone(),
            config.ffprobe_bin.clone(),
        )),
        PartitionPolicy::FrameAligned { target_size } => {
            Box::new(FrameAlignedPartitioner::new(*target_size))
        }
    }
}

/// File extension for a source's chunk files
fn chunk_extension(source: &SourceFile) -> String {
    source
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}
