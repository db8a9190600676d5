//! Lookup cache
//!
//! Memoizes record-store lookups for the stream server. Each concern has
//! its own typed namespace:
//! - `sources`: processed source records by id
//! - `indexes`: chunk indexes by source id
//!
//! Only processed sources are cached. A processed source changes only when
//! it is partitioned again or deleted; whoever does that calls
//! `invalidate_source`, and the TTL bounds staleness across processes.
//! Open file handles are never cached.

mod lru;
mod ttl;

pub use lru::LruTracker;
pub use ttl::{CacheStats, TtlCache};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::index::ChunkIndex;
use crate::metadata::{RecordStore, SourceFile};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed cache namespaces shared by request handlers
pub struct LookupCache {
    sources: TtlCache<String, Arc<SourceFile>>,
    indexes: TtlCache<String, Arc<ChunkIndex>>,
}

/// Stats for every namespace
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupStats {
    pub sources: CacheStats,
    pub indexes: CacheStats,
}

impl LookupCache {
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs);
        LookupCache {
            sources: TtlCache::new(ttl, config.max_entries),
            indexes: TtlCache::new(ttl, config.max_entries),
        }
    }

    /// The processed source `id`.
    ///
    /// Fails with `NotFound` for unknown ids and `NotProcessed` for sources
    /// still waiting on the partitioner; neither outcome is cached.
    pub async fn processed_source(
        &self,
        store: &Arc<dyn RecordStore>,
        id: &str,
    ) -> Result<Arc<SourceFile>> {
        self.sources
            .get_or_try_init(&id.to_string(), || async {
                let source = store
                    .get_source(id)?
                    .ok_or_else(|| Error::NotFound(format!("source {}", id)))?;
                if !source.processed() {
                    return Err(Error::NotProcessed(id.to_string()));
                }
                debug!("Loaded source {} into cache", id);
                Ok(Arc::new(source))
            })
            .await
    }

    /// The chunk index of processed source `id`
    pub async fn chunk_index(
        &self,
        store: &Arc<dyn RecordStore>,
        id: &str,
    ) -> Result<Arc<ChunkIndex>> {
        self.processed_source(store, id).await?;
        self.indexes
            .get_or_try_init(&id.to_string(), || async {
                let chunks = store.list_chunks(id)?;
                let index = ChunkIndex::build(chunks)?;
                debug!("Built chunk index for {} ({} chunks)", id, index.len());
                Ok(Arc::new(index))
            })
            .await
    }

    /// Forget everything cached about source `id`
    pub fn invalidate_source(&self, id: &str) {
        let key = id.to_string();
        self.sources.invalidate(&key);
        self.indexes.invalidate(&key);
    }

    pub fn clear(&self) {
        self.sources.clear();
        self.indexes.clear();
    }

    pub fn stats(&self) -> LookupStats {
        LookupStats {
            sources: self.sources.stats(),
            indexes: self.indexes.stats(),
        }
    }
}
