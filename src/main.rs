//! chunkstream - Chunked audio storage with byte-range streaming
//!
//! Usage:
//!   chunkstream serve               - Run the HTTP server and partition job
//!   chunkstream import <file>       - Register a file as an unprocessed source
//!   chunkstream partition           - Partition one batch now
//!   chunkstream sources             - List sources
//!   chunkstream chunks <id>         - List a source's chunks
//!   chunkstream remove <id>         - Delete a source and its chunks
//!   chunkstream init                - Write a default configuration file
//!
//! `serve` holds the record store exclusively; the other commands need it
//! stopped. While it runs, new files arrive through `POST /file`.

use anyhow::{bail, Context};
use chunkstream::{
    cache::LookupCache,
    config::Config,
    metadata::{RecordStore, SledStore, SourceFile, SourceFilter},
    partition::{self, ChunkJob},
    server::{self, AppState},
    storage::ChunkStore,
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "chunkstream")]
#[command(author = "chunkstream Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Chunked audio storage with byte-range streaming over HTTP")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/chunkstream/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the HTTP server and the background partition job
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Do not run the partition job
        #[arg(long)]
        no_job: bool,
    },

    /// Register a file as an unprocessed source
    Import {
        /// File to import
        file: PathBuf,

        /// Display name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Copy the file into the data directory instead of referencing it
        #[arg(long)]
        copy: bool,

        /// JSON metadata to attach
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Partition one batch of unprocessed sources now
    Partition {
        /// Maximum sources to process
        #[arg(short, long)]
        batch: Option<usize>,

        /// Delete originals once their chunks are committed
        #[arg(long)]
        delete_original: bool,
    },

    /// List sources
    Sources {
        /// Only show processed sources
        #[arg(long)]
        processed: bool,
    },

    /// List a source's chunks
    Chunks {
        /// Source ID
        id: String,
    },

    /// Delete a source, its chunk records and chunk files
    Remove {
        /// Source ID
        id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => cmd_init(config_path, force),
        Commands::Serve { bind, no_job } => cmd_serve(config_path, bind, no_job),
        Commands::Import {
            file,
            name,
            copy,
            metadata,
        } => cmd_import(config_path, &file, name, copy, metadata),
        Commands::Partition {
            batch,
            delete_original,
        } => cmd_partition(config_path, batch, delete_original),
        Commands::Sources { processed } => cmd_sources(config_path, processed),
        Commands::Chunks { id } => cmd_chunks(config_path, &id),
        Commands::Remove { id } => cmd_remove(config_path, &id),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    let config = Config::load_or_default(config_path)
        .with_context(|| format!("loading configuration from {:?}", config_path))?;
    config
        .ensure_directories()
        .with_context(|| format!("creating data directory {:?}", config.data_dir))?;
    Ok(config)
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store = SledStore::open(config.db_path()).with_context(|| {
        format!(
            "opening record store at {:?} (if `chunkstream serve` is running it holds the store; upload through POST /file)",
            config.db_path()
        )
    })?;
    Ok(Arc::new(store))
}

fn cmd_init(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", config_path);
    }

    let config = Config::default();
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    Ok(())
}

fn cmd_serve(config_path: &Path, bind: Option<SocketAddr>, no_job: bool) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(addr) = bind {
        config.server.bind_addr = addr;
    }

    let store = open_store(&config)?;
    let chunks = ChunkStore::new(config.chunk_dir());
    let cache = Arc::new(LookupCache::new(&config.cache));

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let job_handle = if config.job.enabled && !no_job {
            let job = ChunkJob::new(
                store.clone(),
                chunks.clone(),
                partition::from_config(&config.chunk),
                config.job.clone(),
            )
            .with_cache(cache.clone());
            Some(tokio::spawn(Arc::new(job).run_loop(shutdown_rx)))
        } else {
            info!("Partition job disabled");
            None
        };

        let state = Arc::new(AppState {
            store,
            chunks,
            cache,
            uploads: config.upload_dir(),
            config: config.server.clone(),
        });

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down...");
        };

        server::serve(state, config.server.bind_addr, shutdown).await?;

        let _ = shutdown_tx.send(true);
        if let Some(handle) = job_handle {
            if let Err(e) = handle.await {
                warn!("Partition job ended abnormally: {}", e);
            }
        }
        Ok(())
    })
}

fn cmd_import(
    config_path: &Path,
    file: &Path,
    name: Option<String>,
    copy: bool,
    metadata: Option<String>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let file = file
        .canonicalize()
        .with_context(|| format!("cannot read {:?}", file))?;
    let size = std::fs::metadata(&file)?.len();
    if size == 0 {
        bail!("{:?} is empty", file);
    }

    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string())
    });

    let mut source = SourceFile::new(file.clone(), name, size);
    if let Some(raw) = metadata {
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("metadata must be valid JSON")?;
        source = source.with_metadata(value);
    }

    if copy {
        let ext = file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let target = config.upload_dir().join(format!("{}{}", source.id, ext));
        std::fs::copy(&file, &target)
            .with_context(|| format!("copying {:?} to {:?}", file, target))?;
        source.path = target;
    }

    store.create_source(&source)?;
    info!("Imported {} as {} ({} bytes)", source.name, source.id, size);
    println!("{}", source.id);
    Ok(())
}

fn cmd_partition(
    config_path: &Path,
    batch: Option<usize>,
    delete_original: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(batch) = batch {
        config.job.batch_size = batch.max(1);
    }
    config.job.delete_original |= delete_original;

    let store = open_store(&config)?;
    let job = ChunkJob::new(
        store,
        ChunkStore::new(config.chunk_dir()),
        partition::from_config(&config.chunk),
        config.job.clone(),
    );

    let report = job.run_batch();
    report.log();
    let report = report.into_result()?;

    println!(
        "Processed {} of {} sources ({} chunks)",
        report.processed,
        report.total,
        report.chunk_ids.len()
    );
    Ok(())
}

fn cmd_sources(config_path: &Path, processed: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let filter = if processed {
        SourceFilter::Processed
    } else {
        SourceFilter::All
    };
    let sources = store.find_sources(&filter, 0)?;

    if sources.is_empty() {
        println!("No sources");
        return Ok(());
    }

    println!("{:<36}  {:<11}  {:>12}  {}", "ID", "STATE", "SIZE", "NAME");
    for source in sources {
        println!(
            "{:<36}  {:<11}  {:>12}  {}",
            source.id,
            source.state_label(),
            source.size,
            source.name
        );
    }
    Ok(())
}

fn cmd_chunks(config_path: &Path, id: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let source = store
        .get_source(id)?
        .with_context(|| format!("no source {}", id))?;
    let chunks = store.list_chunks(id)?;

    println!(
        "{} ({}), {} chunks",
        source.name,
        source.state_label(),
        chunks.len()
    );
    for chunk in chunks {
        println!(
            "  #{:<5} {:>12}-{:<12} {} {:>10} bytes  {}",
            chunk.order,
            chunk.start,
            chunk.end,
            chunk.unit,
            chunk.size,
            chunk.id
        );
    }
    Ok(())
}

fn cmd_remove(config_path: &Path, id: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let Some((source, chunks)) = store.delete_source(id)? else {
        bail!("no source {}", id);
    };
    ChunkStore::new(config.chunk_dir()).clear_source(id)?;

    // Copies made by `import --copy` belong to us
    if source.path.starts_with(config.upload_dir()) {
        if let Err(e) = std::fs::remove_file(&source.path) {
            warn!("Failed to remove {:?}: {}", source.path, e);
        }
    }

    info!("Removed {} and {} chunks", source.name, chunks.len());
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
