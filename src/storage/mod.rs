//! Chunk file storage
//!
//! Chunk files live on the local filesystem under one directory per source,
//! with one subdirectory per partition attempt:
//! ```text
//! {root}/
//!   {source id}/
//!     {attempt}/
//!       00001.{ext}
//!       00002.{ext}
//! ```
//! An attempt only ever writes inside its own directory, so a worker that
//! lost its claim cannot touch the files another worker committed.
//! Readers never share handles: every read opens its own file, so
//! concurrent range requests cannot disturb each other's positions.

mod writer;

pub use writer::{ChunkWriter, WrittenChunk};

use crate::error::{Error, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Local filesystem store for chunk files
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

/// Where one partition attempt writes the chunk files of a source
#[derive(Debug, Clone)]
pub struct AttemptDir {
    source_id: String,
    dir: PathBuf,
}

impl AttemptDir {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the chunk file with the given order
    pub fn chunk_path(&self, order: u32, ext: &str) -> PathBuf {
        self.dir.join(format!("{:05}.{}", order, ext))
    }

    /// Scratch space for tools that produce files before they become chunks
    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.join(".work")
    }

    /// Start writing a chunk file
    pub fn create_chunk(&self, order: u32, ext: &str) -> Result<ChunkWriter> {
        ChunkWriter::create(&self.chunk_path(order, ext))
    }

    /// Move an externally produced file into place as a chunk
    pub fn adopt_chunk(&self, order: u32, ext: &str, produced: &Path) -> Result<WrittenChunk> {
        let target = self.chunk_path(order, ext);
        std::fs::create_dir_all(&self.dir)?;

        if std::fs::rename(produced, &target).is_err() {
            // Different filesystem; fall back to copy + remove
            std::fs::copy(produced, &target)?;
            std::fs::remove_file(produced)?;
        }

        let file = std::fs::File::open(&target)?;
        file.sync_all()?;

        let mut hasher = blake3::Hasher::new();
        let size = std::io::copy(&mut std::io::BufReader::new(file), &mut hasher)?;

        Ok(WrittenChunk {
            path: target,
            size,
            content_hash: hasher.finalize().to_hex().to_string(),
        })
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!("Removed chunk directory {:?}", dir);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

impl ChunkStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ChunkStore { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all chunks of a source
    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.root.join(source_id)
    }

    /// Directory of partition attempt `attempt` on a source
    pub fn attempt(&self, source_id: &str, attempt: &str) -> AttemptDir {
        AttemptDir {
            source_id: source_id.to_string(),
            dir: self.source_dir(source_id).join(attempt),
        }
    }

    /// Remove every file an attempt wrote
    pub fn remove_attempt(&self, attempt: &AttemptDir) -> Result<()> {
        remove_dir(&attempt.dir)
    }

    /// Remove every attempt of a source except `keep`, returning how many
    pub fn prune_attempts(&self, keep: &AttemptDir) -> Result<usize> {
        let entries = match std::fs::read_dir(self.source_dir(&keep.source_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path != keep.dir {
                remove_dir(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every chunk file of a source
    pub fn clear_source(&self, source_id: &str) -> Result<()> {
        remove_dir(&self.source_dir(source_id))
    }

    /// Open `len` bytes of a chunk file starting at `offset`.
    ///
    /// Each call gets its own handle; it is released when the reader drops.
    pub async fn open_range(
        &self,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> Result<impl AsyncRead + Send + Unpin + 'static> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("chunk file {:?} is missing", path),
                ))
            } else {
                Error::Io(e)
            }
        })?;

        let file_size = file.metadata().await?.len();
        if offset.saturating_add(len) > file_size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "chunk file {:?} has {} bytes, need {}..{}",
                    path,
                    file_size,
                    offset,
                    offset + len
                ),
            )));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.take(len))
    }
}
