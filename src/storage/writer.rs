//! Durable chunk file writer

use crate::error::Result;
use blake3::Hasher;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A chunk file that has been fully written and synced
#[derive(Debug, Clone)]
pub struct WrittenChunk {
    pub path: PathBuf,
    pub size: u64,
    /// BLAKE3 hex digest of the file contents
    pub content_hash: String,
}

/// Streams bytes into a new chunk file, hashing as it goes
pub struct ChunkWriter {
    path: PathBuf,
    out: BufWriter<File>,
    hasher: Hasher,
    written: u64,
}

impl ChunkWriter {
    /// Create (or truncate) the chunk file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(ChunkWriter {
            path: path.to_path_buf(),
            out: BufWriter::with_capacity(64 * 1024, file),
            hasher: Hasher::new(),
            written: 0,
        })
    }

    /// Append bytes
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data)?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync; the chunk is durable once this returns
    pub fn finish(self) -> Result<WrittenChunk> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(WrittenChunk {
            path: self.path,
            size: self.written,
            content_hash: self.hasher.finalize().to_hex().to_string(),
        })
    }
}
