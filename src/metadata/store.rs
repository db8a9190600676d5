//! Record store for sources and chunks
//!
//! `RecordStore` is the contract the core needs from durable storage:
//! create, find by filter, save, plus the claim/commit operations the
//! partitioner relies on. `SledStore` implements it on top of sled.
//!
//! Layout:
//! - tree `sources`: source id -> JSON `SourceFile`
//! - tree `chunks`:  `c/<source id>/<order be32>` -> JSON `ChunkRecord`
//!                   `i/<chunk id>` -> the `c/...` key of that chunk

use super::record::{ChunkRecord, OffsetUnit, ProcessingState, SourceFile};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::Transactional;
use std::path::Path;
use tracing::debug;

/// Selection criteria for `find_sources`
#[derive(Debug, Clone)]
pub enum SourceFilter {
    All,
    Processed,
    Unprocessed,
    /// Sources a partitioner may claim right now
    Claimable {
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    },
}

impl SourceFilter {
    fn matches(&self, source: &SourceFile) -> bool {
        match self {
            SourceFilter::All => true,
            SourceFilter::Processed => source.processed(),
            SourceFilter::Unprocessed => !source.processed(),
            SourceFilter::Claimable {
                stale_before,
                max_attempts,
            } => source.is_claimable(*stale_before, *max_attempts),
        }
    }
}

/// Durable storage of source and chunk records
pub trait RecordStore: Send + Sync {
    /// Insert a new source; fails if the id exists
    fn create_source(&self, source: &SourceFile) -> Result<()>;

    /// Fetch a source by id
    fn get_source(&self, id: &str) -> Result<Option<SourceFile>>;

    /// Sources matching `filter`, newest first, at most `limit` (0 = all)
    fn find_sources(&self, filter: &SourceFilter, limit: usize) -> Result<Vec<SourceFile>>;

    /// Atomically move a claimable source into `Claimed` by `worker`
    fn claim_source(
        &self,
        id: &str,
        worker: &str,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<SourceFile>;

    /// Give up a claim, recording the failure
    fn release_claim(&self, id: &str, worker: &str, error: &str) -> Result<()>;

    /// Replace the chunk records of a claimed source and mark it processed.
    ///
    /// The single commit point of partitioning: both happen atomically, and
    /// only while `worker` still holds the claim.
    fn commit_chunks(
        &self,
        id: &str,
        worker: &str,
        chunks: &[ChunkRecord],
        unit: OffsetUnit,
        extent: u64,
    ) -> Result<SourceFile>;

    /// Chunks of a source ordered by `order`
    fn list_chunks(&self, source_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Fetch a single chunk by id
    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    /// Remove a source and, by cascade, its chunk records
    fn delete_source(&self, id: &str) -> Result<Option<(SourceFile, Vec<ChunkRecord>)>>;
}

/// sled-backed record store.
///
/// sled locks the database directory, so one process owns a store at a time.
pub struct SledStore {
    db: sled::Db,
    sources: sled::Tree,
    chunks: sled::Tree,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Open a throwaway store that is removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let sources = db.open_tree("sources")?;
        let chunks = db.open_tree("chunks")?;
        Ok(SledStore {
            db,
            sources,
            chunks,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Every `c/...` and `i/...` key recorded for a source
    fn chunk_keys(&self, source_id: &str) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.chunks.scan_prefix(chunk_prefix(source_id)) {
            let (key, raw) = item?;
            let old: ChunkRecord = decode(&raw)?;
            keys.push(key.to_vec());
            keys.push(chunk_id_key(&old.id));
        }
        Ok(keys)
    }

    /// Remove all chunk records of a source, returning what was removed
    fn delete_chunks(&self, source_id: &str) -> Result<Vec<ChunkRecord>> {
        let removed = self.list_chunks(source_id)?;
        if removed.is_empty() {
            return Ok(removed);
        }

        let mut batch = sled::Batch::default();
        for key in self.chunk_keys(source_id)? {
            batch.remove(key);
        }
        self.chunks.apply_batch(batch)?;
        self.chunks.flush()?;
        Ok(removed)
    }

    /// Compare-and-swap a source from its current stored bytes to the
    /// result of `update`. `update` may reject the current state.
    fn update_source<F>(&self, id: &str, mut update: F) -> Result<SourceFile>
    where
        F: FnMut(&SourceFile) -> Result<SourceFile>,
    {
        loop {
            let current_raw = self
                .sources
                .get(id.as_bytes())?
                .ok_or_else(|| Error::NotFound(format!("source {}", id)))?;
            let current: SourceFile = decode(&current_raw)?;

            let mut next = update(&current)?;
            next.updated = Utc::now();
            let next_raw = encode(&next)?;

            match self
                .sources
                .compare_and_swap(id.as_bytes(), Some(&current_raw), Some(next_raw))?
            {
                Ok(()) => {
                    self.sources.flush()?;
                    return Ok(next);
                }
                // Lost a race; re-read and let `update` decide again
                Err(_) => debug!("Concurrent update on source {}, retrying", id),
            }
        }
    }
}

fn ensure_claimed_by(source: &SourceFile, worker: &str) -> Result<()> {
    match &source.state {
        ProcessingState::Claimed { by, .. } if by == worker => Ok(()),
        _ => Err(Error::ClaimConflict(format!(
            "{} is not claimed by {}",
            source.id, worker
        ))),
    }
}

fn chunk_prefix(source_id: &str) -> Vec<u8> {
    format!("c/{}/", source_id).into_bytes()
}

fn chunk_key(source_id: &str, order: u32) -> Vec<u8> {
    let mut key = chunk_prefix(source_id);
    key.extend_from_slice(&order.to_be_bytes());
    key
}

fn chunk_id_key(chunk_id: &str) -> Vec<u8> {
    format!("i/{}", chunk_id).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Deserialization(e.to_string()))
}

impl RecordStore for SledStore {
    fn create_source(&self, source: &SourceFile) -> Result<()> {
        let raw = encode(source)?;
        match self
            .sources
            .compare_and_swap(source.id.as_bytes(), None::<&[u8]>, Some(raw))?
        {
            Ok(()) => {
                self.sources.flush()?;
                Ok(())
            }
            Err(_) => Err(Error::Internal(format!("source {} already exists", source.id))),
        }
    }

    fn get_source(&self, id: &str) -> Result<Option<SourceFile>> {
        match self.sources.get(id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn find_sources(&self, filter: &SourceFilter, limit: usize) -> Result<Vec<SourceFile>> {
        let mut found = Vec::new();
        for item in self.sources.iter() {
            let (_, raw) = item?;
            let source: SourceFile = decode(&raw)?;
            if filter.matches(&source) {
                found.push(source);
            }
        }

        found.sort_by(|a, b| b.created.cmp(&a.created));
        if limit > 0 {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn claim_source(
        &self,
        id: &str,
        worker: &str,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<SourceFile> {
        self.update_source(id, |current| {
            if !current.is_claimable(stale_before, max_attempts) {
                return Err(Error::ClaimConflict(format!(
                    "{} is {}",
                    id,
                    current.state_label()
                )));
            }
            let mut next = current.clone();
            next.state = ProcessingState::Claimed {
                by: worker.to_string(),
                at: Utc::now(),
            };
            Ok(next)
        })
    }

    fn release_claim(&self, id: &str, worker: &str, error: &str) -> Result<()> {
        self.update_source(id, |current| {
            ensure_claimed_by(current, worker)?;
            let mut next = current.clone();
            next.attempts += 1;
            next.state = ProcessingState::Failed {
                last_error: error.to_string(),
            };
            Ok(next)
        })?;
        Ok(())
    }

    fn commit_chunks(
        &self,
        id: &str,
        worker: &str,
        chunks: &[ChunkRecord],
        unit: OffsetUnit,
        extent: u64,
    ) -> Result<SourceFile> {
        // Only the claim holder writes under this prefix, and the
        // transaction below aborts unless that is still `worker`
        let stale = self.chunk_keys(id)?;
        let mut fresh = Vec::with_capacity(chunks.len() * 2);
        for chunk in chunks {
            let key = chunk_key(id, chunk.order);
            fresh.push((chunk_id_key(&chunk.id), key.clone()));
            fresh.push((key, encode(chunk)?));
        }

        let committed = (&self.sources, &self.chunks)
            .transaction(
                |(sources, chunk_tree)| -> ConflictableTransactionResult<SourceFile, Error> {
                    let raw = sources.get(id.as_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(Error::NotFound(format!(
                            "source {}",
                            id
                        )))
                    })?;
                    let mut next: SourceFile =
                        decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                    ensure_claimed_by(&next, worker)
                        .map_err(ConflictableTransactionError::Abort)?;

                    next.state = ProcessingState::Processed { at: Utc::now() };
                    next.offset_unit = Some(unit);
                    next.extent = Some(extent);
                    next.updated = Utc::now();
                    let next_raw = encode(&next).map_err(ConflictableTransactionError::Abort)?;
                    sources.insert(id.as_bytes(), next_raw)?;

                    for key in &stale {
                        chunk_tree.remove(key.as_slice())?;
                    }
                    for (key, value) in &fresh {
                        chunk_tree.insert(key.as_slice(), value.as_slice())?;
                    }
                    Ok(next)
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => Error::Database(e),
            })?;

        self.db.flush()?;
        Ok(committed)
    }

    fn list_chunks(&self, source_id: &str) -> Result<Vec<ChunkRecord>> {
        // Big-endian order suffix keeps the scan sorted by chunk order
        self.chunks
            .scan_prefix(chunk_prefix(source_id))
            .map(|item| {
                let (_, raw) = item?;
                decode(&raw)
            })
            .collect()
    }

    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let Some(key) = self.chunks.get(chunk_id_key(chunk_id))? else {
            return Ok(None);
        };
        match self.chunks.get(key)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn delete_source(&self, id: &str) -> Result<Option<(SourceFile, Vec<ChunkRecord>)>> {
        let Some(source) = self.get_source(id)? else {
            return Ok(None);
        };
        let chunks = self.delete_chunks(id)?;
        self.sources.remove(id.as_bytes())?;
        self.sources.flush()?;
        Ok(Some((source, chunks)))
    }
}
