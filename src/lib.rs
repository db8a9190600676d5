//! chunkstream - Chunked audio storage with byte-range streaming
//!
//! Uploaded audio files are partitioned in the background into ordered,
//! independently stored chunk files. An HTTP server then answers standard
//! `Range` requests against the logical original by reading only the chunks
//! the range touches.

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod metadata;
pub mod partition;
pub mod range;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::index::ChunkIndex;
    pub use crate::metadata::{ChunkRecord, OffsetUnit, RecordStore, SourceFile};
    pub use crate::range::ByteRange;
}
