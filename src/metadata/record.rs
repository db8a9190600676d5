//! Source file and chunk records
//!
//! These are the rows the record store persists. A source file is the
//! uploaded original; its chunks are the ordered, independently stored
//! slices produced by a partitioner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unit of a chunk's start/end offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetUnit {
    /// Byte offsets into the original file
    Bytes,
    /// Milliseconds of decoded audio
    Millis,
}

impl std::fmt::Display for OffsetUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OffsetUnit::Bytes => write!(f, "bytes"),
            OffsetUnit::Millis => write!(f, "ms"),
        }
    }
}

/// Processing state of a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingState {
    /// Waiting for a partitioner
    Unprocessed,
    /// A partitioner has taken ownership
    Claimed { by: String, at: DateTime<Utc> },
    /// All chunks recorded; immutable from here on
    Processed { at: DateTime<Utc> },
    /// Last attempt failed
    Failed { last_error: String },
}

/// One uploaded audio asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: String,
    /// Where the original bytes live
    pub path: PathBuf,
    /// Human file name
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    pub state: ProcessingState,
    /// Arbitrary metadata supplied at upload
    pub metadata: serde_json::Value,
    /// Unit of the chunk offsets, set once processed
    pub offset_unit: Option<OffsetUnit>,
    /// Total extent in `offset_unit` (bytes or duration), set once processed
    pub extent: Option<u64>,
    /// Failed partition attempts so far
    #[serde(default)]
    pub attempts: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl SourceFile {
    /// Create a new unprocessed source
    pub fn new(path: PathBuf, name: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        SourceFile {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            name: name.into(),
            size,
            state: ProcessingState::Unprocessed,
            metadata: serde_json::Value::Object(Default::default()),
            offset_unit: None,
            extent: None,
            attempts: 0,
            created: now,
            updated: now,
        }
    }

    /// Attach upload metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether partitioning has completed
    pub fn processed(&self) -> bool {
        matches!(self.state, ProcessingState::Processed { .. })
    }

    /// Whether a partitioner may claim this source
    pub fn is_claimable(&self, stale_before: DateTime<Utc>, max_attempts: u32) -> bool {
        match &self.state {
            ProcessingState::Unprocessed => true,
            ProcessingState::Claimed { at, .. } => *at < stale_before,
            ProcessingState::Processed { .. } => false,
            ProcessingState::Failed { .. } => max_attempts == 0 || self.attempts < max_attempts,
        }
    }

    /// Short state label for listings
    pub fn state_label(&self) -> &'static str {
        match self.state {
            ProcessingState::Unprocessed => "unprocessed",
            ProcessingState::Claimed { .. } => "claimed",
            ProcessingState::Processed { .. } => "processed",
            ProcessingState::Failed { .. } => "failed",
        }
    }
}

/// One contiguous, independently stored slice of a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub source_id: String,
    /// Location of the chunk's own bytes
    pub storage_path: PathBuf,
    /// 1-based position in the source
    pub order: u32,
    /// First offset covered (inclusive)
    pub start: u64,
    /// Last offset covered (inclusive)
    pub end: u64,
    /// Size of the chunk file in bytes
    pub size: u64,
    pub unit: OffsetUnit,
    /// Bytes of replicated container header before the covered content
    pub payload_offset: u64,
    /// BLAKE3 hash of the chunk file
    pub content_hash: String,
    pub created: DateTime<Utc>,
}

impl ChunkRecord {
    /// Whether `point` falls inside this chunk
    pub fn contains(&self, point: u64) -> bool {
        self.start <= point && point <= self.end
    }

    /// Width of the covered interval in `unit`
    pub fn extent(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Position inside the chunk file of the byte at logical `offset`
    pub fn file_offset(&self, offset: u64) -> u64 {
        self.payload_offset + (offset - self.start)
    }
}

/// Draft of a chunk produced by a partitioner before it is recorded
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub storage_path: PathBuf,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub payload_offset: u64,
    pub content_hash: String,
}

impl ChunkDraft {
    /// Turn the draft into a record with its final order
    pub fn into_record(self, source_id: &str, order: u32, unit: OffsetUnit) -> ChunkRecord {
        ChunkRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            storage_path: self.storage_path,
            order,
            start: self.start,
            end: self.end,
            size: self.size,
            unit,
            payload_offset: self.payload_offset,
            content_hash: self.content_hash,
            created: Utc::now(),
        }
    }
}
