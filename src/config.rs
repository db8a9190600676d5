//! Configuration management for chunkstream

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default chunk size: 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default time segment length in seconds
pub const DEFAULT_SEGMENT_SECS: f64 = 10.0;

/// Default number of sources partitioned per job run
pub const DEFAULT_BATCH_SIZE: usize = 2;

/// Default cache entry lifetime: 5 minutes
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default content type for streamed media
pub const DEFAULT_CONTENT_TYPE: &str = "audio/flac";

/// Default upload size limit: 2GB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Partitioning configuration
    pub chunk: ChunkConfig,

    /// Background job configuration
    pub job: JobConfig,

    /// Lookup cache configuration
    pub cache: CacheConfig,

    /// Path to the data directory (record database, chunk files)
    pub data_dir: PathBuf,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,

    /// Content type sent with media responses
    pub content_type: String,

    /// Serve the whole file with 200 when no Range header is present
    pub full_body_without_range: bool,

    /// Largest file accepted by `POST /file`
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

/// How sources are split into chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Fixed byte-size chunks (works for any byte stream)
    FixedSize { chunk_size: u64 },
    /// Fixed-duration segments cut by an external segmenter, offsets in ms
    TimeSegments { segment_secs: f64 },
    /// FLAC frame-aligned chunks, each prefixed with the container header
    FrameAligned { target_size: u64 },
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        PartitionPolicy::FixedSize {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Active partitioning policy
    pub policy: PartitionPolicy,

    /// ffmpeg binary used by the time-segment policy
    pub ffmpeg_bin: PathBuf,

    /// ffprobe binary used by the time-segment policy
    pub ffprobe_bin: PathBuf,
}

/// Background partition job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Run the job inside `serve`
    pub enabled: bool,

    /// Seconds between job runs
    pub interval_secs: u64,

    /// Maximum sources processed per run
    pub batch_size: usize,

    /// Remove the original file once its chunks are committed
    pub delete_original: bool,

    /// Claims older than this are considered abandoned
    pub claim_timeout_secs: u64,

    /// Failed sources are retried until this many attempts (0 = forever)
    pub max_attempts: u32,
}

/// Lookup cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry lifetime in seconds (0 disables caching)
    pub ttl_secs: u64,

    /// Maximum entries per cache namespace
    pub max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chunkstream");

        Config {
            server: ServerConfig::default(),
            chunk: ChunkConfig::default(),
            job: JobConfig::default(),
            cache: CacheConfig::default(),
            data_dir,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            full_body_without_range: true,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            policy: PartitionPolicy::default(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            enabled: true,
            interval_secs: 60,
            batch_size: DEFAULT_BATCH_SIZE,
            delete_original: false,
            claim_timeout_secs: 15 * 60,
            max_attempts: 3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_entries: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the config file if it exists, otherwise defaults plus environment
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CHUNKSTREAM_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(addr) = std::env::var("CHUNKSTREAM_BIND") {
            if let Ok(addr) = addr.trim().parse::<SocketAddr>() {
                self.server.bind_addr = addr;
            }
        }

        if let Ok(chunk_size) = std::env::var("CHUNKSTREAM_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<u64>() {
                self.chunk.policy = PartitionPolicy::FixedSize { chunk_size: size };
            }
        }

        if let Ok(batch) = std::env::var("CHUNKSTREAM_BATCH_SIZE") {
            if let Ok(batch) = batch.trim().parse::<usize>() {
                self.job.batch_size = batch;
            }
        }

        if let Ok(flag) = std::env::var("CHUNKSTREAM_DELETE_ORIGINAL") {
            self.job.delete_original = matches!(flag.trim(), "1" | "true" | "yes");
        }

        if let Ok(ttl) = std::env::var("CHUNKSTREAM_CACHE_TTL") {
            if let Ok(ttl) = ttl.trim().parse::<u64>() {
                self.cache.ttl_secs = ttl;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match &self.chunk.policy {
            PartitionPolicy::FixedSize { chunk_size } if *chunk_size == 0 => {
                return Err(Error::InvalidConfig(
                    "Chunk size must be greater than 0".to_string(),
                ));
            }
            PartitionPolicy::FrameAligned { target_size } if *target_size == 0 => {
                return Err(Error::InvalidConfig(
                    "Frame-aligned target size must be greater than 0".to_string(),
                ));
            }
            PartitionPolicy::TimeSegments { segment_secs }
                if !segment_secs.is_finite() || *segment_secs < 0.001 =>
            {
                return Err(Error::InvalidConfig(
                    "Segment length must be at least 1ms".to_string(),
                ));
            }
            _ => {}
        }

        if self.job.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.job.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "Job interval must be greater than 0".to_string(),
            ));
        }

        if self.server.max_upload_bytes == 0 {
            return Err(Error::InvalidConfig(
                "Upload limit must be greater than 0".to_string(),
            ));
        }

        if self.server.content_type.is_empty() {
            return Err(Error::InvalidConfig(
                "Content type must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Location of the record database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }

    /// Root directory for chunk files
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    /// Directory imported originals are copied into
    pub fn upload_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.chunk_dir())?;
        std::fs::create_dir_all(self.upload_dir())?;
        Ok(())
    }
}
