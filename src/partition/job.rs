//! Batch partition job
//!
//! Picks up to `batch_size` claimable sources (newest first), claims each
//! one, rewrites its chunks and commits it as processed. A failure on one
//! source is recorded and the batch moves on.

use super::Partitioner;
use crate::cache::LookupCache;
use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::metadata::{RecordStore, SourceFile, SourceFilter};
use crate::storage::{AttemptDir, ChunkStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Sources selected for this batch
    pub total: usize,
    /// Sources committed as processed
    pub processed: usize,
    /// Sources another worker claimed first
    pub skipped: usize,
    /// Ids of every chunk recorded
    pub chunk_ids: Vec<String>,
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl BatchReport {
    /// Convert to an error if anything in the batch failed
    pub fn into_result(self) -> Result<BatchReport> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialBatchFailure {
                failed: self.errors.len(),
                total: self.total,
                errors: self.errors,
            })
        }
    }

    /// Log a one-line summary
    pub fn log(&self) {
        let ms = self.elapsed.as_secs_f64() * 1000.0;
        if !self.errors.is_empty() {
            error!(
                "Partition batch: {} sources, {} processed, {} chunks in {:.1} ms; errors: {}",
                self.total,
                self.processed,
                self.chunk_ids.len(),
                ms,
                self.errors.join("; ")
            );
        } else if self.total > 0 {
            info!(
                "Partition batch: {} sources, {} processed, {} chunks in {:.1} ms",
                self.total,
                self.processed,
                self.chunk_ids.len(),
                ms
            );
        } else {
            debug!("Partition batch: nothing to process");
        }
    }
}

/// Drives a partitioner over unprocessed sources
pub struct ChunkJob {
    store: Arc<dyn RecordStore>,
    chunks: ChunkStore,
    partitioner: Box<dyn Partitioner>,
    cache: Option<Arc<LookupCache>>,
    config: JobConfig,
    worker_id: String,
}

impl ChunkJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        chunks: ChunkStore,
        partitioner: Box<dyn Partitioner>,
        config: JobConfig,
    ) -> Self {
        ChunkJob {
            store,
            chunks,
            partitioner,
            cache: None,
            config,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Invalidate entries in `cache` whenever a source is committed
    pub fn with_cache(mut self, cache: Arc<LookupCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Identity recorded on claims made by this job
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn stale_before(&self) -> chrono::DateTime<Utc> {
        let timeout = chrono::Duration::seconds(self.config.claim_timeout_secs as i64);
        Utc::now() - timeout
    }

    /// Process one batch of sources
    pub fn run_batch(&self) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport::default();

        let filter = SourceFilter::Claimable {
            stale_before: self.stale_before(),
            max_attempts: self.config.max_attempts,
        };
        let candidates = match self.store.find_sources(&filter, self.config.batch_size) {
            Ok(found) => found,
            Err(e) => {
                report.errors.push(format!("failed to list sources: {}", e));
                report.elapsed = started.elapsed();
                return report;
            }
        };
        report.total = candidates.len();

        for candidate in candidates {
            let claimed = match self.store.claim_source(
                &candidate.id,
                &self.worker_id,
                self.stale_before(),
                self.config.max_attempts,
            ) {
                Ok(source) => source,
                Err(Error::ClaimConflict(reason)) => {
                    debug!("Skipping {}: {}", candidate.id, reason);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.errors.push(format!("source {} failed: {}", candidate.id, e));
                    continue;
                }
            };

            match self.process(&claimed) {
                Ok(chunk_ids) => {
                    report.processed += 1;
                    report.chunk_ids.extend(chunk_ids);
                    if self.config.delete_original {
                        if let Err(e) = std::fs::remove_file(&claimed.path) {
                            report.errors.push(format!(
                                "failed to delete original {:?}: {}",
                                claimed.path, e
                            ));
                        }
                    }
                }
                Err(e) => {
                    warn!("Partitioning {} failed: {}", claimed.id, e);
                    self.abandon(&claimed, &e);
                    report.errors.push(format!("source {} failed: {}", claimed.id, e));
                }
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    /// Directory this worker writes a source's chunk files into
    fn attempt_dir(&self, source: &SourceFile) -> AttemptDir {
        self.chunks.attempt(&source.id, &self.worker_id)
    }

    /// Write the chunks of a claimed source and commit it
    fn process(&self, source: &SourceFile) -> Result<Vec<String>> {
        let out = self.attempt_dir(source);
        // Leftovers from an earlier attempt by this worker
        self.chunks.remove_attempt(&out)?;

        let partitioned = self.partitioner.partition(source, &out)?;
        if partitioned.chunks.is_empty() {
            return Err(Error::InvalidFormat(format!("{} produced no chunks", source.name)));
        }

        let records: Vec<_> = partitioned
            .chunks
            .into_iter()
            .enumerate()
            .map(|(i, draft)| draft.into_record(&source.id, i as u32 + 1, partitioned.unit))
            .collect();
        self.store.commit_chunks(
            &source.id,
            &self.worker_id,
            &records,
            partitioned.unit,
            partitioned.extent,
        )?;

        if let Some(cache) = &self.cache {
            cache.invalidate_source(&source.id);
        }

        // Files of failed or overtaken attempts; nothing references them now
        match self.chunks.prune_attempts(&out) {
            Ok(0) => {}
            Ok(n) => debug!("Removed {} stale attempt directories of {}", n, source.id),
            Err(e) => warn!("Failed to prune attempts of {}: {}", source.id, e),
        }

        info!(
            "Partitioned {} into {} chunks with {} policy",
            source.name,
            records.len(),
            self.partitioner.name()
        );
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Release a failed claim and drop the files this attempt wrote
    fn abandon(&self, source: &SourceFile, cause: &Error) {
        if let Err(e) = self
            .store
            .release_claim(&source.id, &self.worker_id, &cause.to_string())
        {
            // Claim lost to another worker, which keeps its own files
            warn!("Could not release claim on {}: {}", source.id, e);
        }

        if let Err(e) = self.chunks.remove_attempt(&self.attempt_dir(source)) {
            warn!("Failed to remove chunk files of {}: {}", source.id, e);
        }
    }

    /// Run a batch every `interval_secs` until `shutdown` flips to true
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Partition job {} running every {:?} (batch size {})",
            self.worker_id, period, self.config.batch_size
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let job = self.clone();
                    match tokio::task::spawn_blocking(move || job.run_batch()).await {
                        Ok(report) => report.log(),
                        Err(e) => error!("Partition batch aborted: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Partition job {} stopped", self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::metadata::{OffsetUnit, ProcessingState, SledStore};
    use crate::partition::{FixedSizePartitioner, Partitioned};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<dyn RecordStore>,
        chunks: ChunkStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let chunks = ChunkStore::new(dir.path().join("chunks"));
            Fixture {
                dir,
                store: Arc::new(SledStore::temporary().unwrap()),
                chunks,
            }
        }

        fn add_source(&self, name: &str, size: usize, age_secs: i64) -> SourceFile {
            let path = self.dir.path().join(format!("{}.bin", name));
            let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
            std::fs::write(&path, data).unwrap();

            let mut source = SourceFile::new(path, name, size as u64);
            source.created = Utc::now() - chrono::Duration::seconds(age_secs);
            self.store.create_source(&source).unwrap();
            source
        }

        fn job(&self, partitioner: Box<dyn Partitioner>, config: JobConfig) -> ChunkJob {
            ChunkJob::new(self.store.clone(), self.chunks.clone(), partitioner, config)
        }
    }

    fn fixed(chunk_size: u64) -> Box<dyn Partitioner> {
        Box::new(FixedSizePartitioner::new(chunk_size))
    }

    /// Fails (after writing its chunk files) for the first `failures` calls
    struct Flaky {
        inner: FixedSizePartitioner,
        failures: AtomicUsize,
    }

    impl Partitioner for Flaky {
        fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned> {
            let result = self.inner.partition(source, out)?;
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Internal("disk hiccup".to_string()));
            }
            Ok(result)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn chunk_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_batch_processes_newest_first() {
        let fx = Fixture::new();
        let oldest = fx.add_source("oldest", 100, 300);
        let middle = fx.add_source("middle", 100, 200);
        let newest = fx.add_source("newest", 100, 100);

        let job = fx.job(fixed(40), JobConfig::default());
        let report = job.run_batch().into_result().unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.chunk_ids.len(), 6);

        assert!(fx.store.get_source(&newest.id).unwrap().unwrap().processed());
        assert!(fx.store.get_source(&middle.id).unwrap().unwrap().processed());
        assert!(!fx.store.get_source(&oldest.id).unwrap().unwrap().processed());
    }

    #[test]
    fn test_commit_records_gapless_chunks() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 10_000, 0);

        fx.job(fixed(4000), JobConfig::default()).run_batch();

        let stored = fx.store.get_source(&source.id).unwrap().unwrap();
        assert_eq!(stored.offset_unit, Some(OffsetUnit::Bytes));
        assert_eq!(stored.extent, Some(10_000));

        let chunks = fx.store.list_chunks(&source.id).unwrap();
        let spans: Vec<_> = chunks.iter().map(|c| (c.order, c.start, c.end)).collect();
        assert_eq!(spans, vec![(1, 0, 3999), (2, 4000, 7999), (3, 8000, 9999)]);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 10_000, 0);
        let job = fx.job(fixed(4000), JobConfig::default());

        job.run_batch();
        let before = fx.store.list_chunks(&source.id).unwrap();

        let report = job.run_batch();
        assert_eq!(report.total, 0);
        assert_eq!(fx.store.list_chunks(&source.id).unwrap(), before);
    }

    #[test]
    fn test_retry_leaves_no_duplicates() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 10_000, 0);
        let flaky = Flaky {
            inner: FixedSizePartitioner::new(4000),
            failures: AtomicUsize::new(1),
        };
        let job = fx.job(Box::new(flaky), JobConfig::default());

        let first = job.run_batch();
        assert_eq!(first.errors.len(), 1);
        let failed = fx.store.get_source(&source.id).unwrap().unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(matches!(failed.state, ProcessingState::Failed { .. }));
        assert!(fx.store.list_chunks(&source.id).unwrap().is_empty());
        assert_eq!(chunk_files(&fx.chunks.source_dir(&source.id)), 0);

        let second = job.run_batch().into_result().unwrap();
        assert_eq!(second.processed, 1);
        let chunks = fx.store.list_chunks(&source.id).unwrap();
        assert_eq!(chunks.iter().map(|c| c.order).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(chunk_files(&fx.chunks.source_dir(&source.id)), 1);
        let attempt = fx.chunks.attempt(&source.id, job.worker_id());
        assert_eq!(chunk_files(attempt.path()), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        std::fs::remove_file(&source.path).unwrap();

        let config = JobConfig {
            max_attempts: 2,
            ..JobConfig::default()
        };
        let job = fx.job(fixed(40), config);

        assert!(matches!(
            job.run_batch().into_result(),
            Err(Error::PartialBatchFailure { failed: 1, total: 1, .. })
        ));
        assert_eq!(job.run_batch().total, 1);
        assert_eq!(job.run_batch().total, 0);
        assert_eq!(fx.store.get_source(&source.id).unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn test_live_claim_is_respected() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        fx.store
            .claim_source(&source.id, "other-worker", Utc::now(), 0)
            .unwrap();

        let report = fx.job(fixed(40), JobConfig::default()).run_batch();
        assert_eq!(report.total, 0);
        assert!(!fx.store.get_source(&source.id).unwrap().unwrap().processed());
    }

    #[test]
    fn test_stale_claim_is_taken_over() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        fx.store
            .claim_source(&source.id, "crashed-worker", Utc::now(), 0)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        let config = JobConfig {
            claim_timeout_secs: 0,
            ..JobConfig::default()
        };
        let report = fx.job(fixed(40), config).run_batch();
        assert_eq!(report.processed, 1);
    }

    /// Loses its claim to `rival` while partitioning
    struct Overtaken {
        inner: FixedSizePartitioner,
        rival: ChunkJob,
    }

    impl Partitioner for Overtaken {
        fn partition(&self, source: &SourceFile, out: &AttemptDir) -> Result<Partitioned> {
            let result = self.inner.partition(source, out)?;
            std::thread::sleep(std::time::Duration::from_millis(10));
            let report = self.rival.run_batch();
            assert_eq!(report.processed, 1);
            Ok(result)
        }

        fn name(&self) -> &'static str {
            "overtaken"
        }
    }

    #[test]
    fn test_overtaken_worker_leaves_winner_intact() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        let config = JobConfig {
            claim_timeout_secs: 0,
            ..JobConfig::default()
        };

        let rival = fx.job(fixed(30), config.clone());
        let rival_dir = fx.chunks.attempt(&source.id, rival.worker_id());
        let slow = fx.job(
            Box::new(Overtaken {
                inner: FixedSizePartitioner::new(40),
                rival,
            }),
            config,
        );
        let slow_dir = fx.chunks.attempt(&source.id, slow.worker_id());

        let report = slow.run_batch();
        assert_eq!(report.processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("not claimed by"));

        // The rival's 30-byte chunks survive, the slow worker's files are gone
        let chunks = fx.store.list_chunks(&source.id).unwrap();
        assert_eq!(chunks.iter().map(|c| c.size).collect::<Vec<_>>(), vec![30, 30, 30, 10]);
        for chunk in &chunks {
            assert!(chunk.storage_path.starts_with(rival_dir.path()));
            assert!(chunk.storage_path.exists());
        }
        assert!(!slow_dir.path().exists());

        let stored = fx.store.get_source(&source.id).unwrap().unwrap();
        assert!(stored.processed());
        assert_eq!(stored.attempts, 0);
    }

    #[test]
    fn test_delete_original_after_commit() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        let config = JobConfig {
            delete_original: true,
            ..JobConfig::default()
        };

        fx.job(fixed(40), config).run_batch().into_result().unwrap();
        assert!(!source.path.exists());
        assert!(fx.store.get_source(&source.id).unwrap().unwrap().processed());
    }

    #[tokio::test]
    async fn test_commit_invalidates_cache() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        let cache = Arc::new(LookupCache::new(&CacheConfig::default()));

        // Negative lookups are not cached, so this leaves no entry behind
        assert!(cache.chunk_index(&fx.store, &source.id).await.is_err());

        let job = fx.job(fixed(40), JobConfig::default()).with_cache(cache.clone());
        job.run_batch().into_result().unwrap();

        let index = cache.chunk_index(&fx.store, &source.id).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.total(), 100);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let fx = Fixture::new();
        let source = fx.add_source("song", 100, 0);
        let job = Arc::new(fx.job(fixed(40), JobConfig::default()));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(job.run_loop(rx));

        // The first tick fires immediately
        for _ in 0..50 {
            if fx.store.get_source(&source.id).unwrap().unwrap().processed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.store.get_source(&source.id).unwrap().unwrap().processed());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
