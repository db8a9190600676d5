//! Metadata storage module
//!
//! Source file and chunk records, and the store that persists them in sled.

mod record;
mod store;

pub use record::{ChunkDraft, ChunkRecord, OffsetUnit, ProcessingState, SourceFile};
pub use store::{RecordStore, SledStore, SourceFilter};
