//! WolfLog - Transaction File Diagnostics
//!
//! Inspects, verifies and dumps a chunked transaction-file database
//! without changing it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflog::chunk::TfChunk;
use wolflog::config::DbConfig;
use wolflog::db::{OpenOptions, TfChunkDb};
use wolflog::error::{CorruptionError, Error, Result};
use wolflog::reader::TfChunkReader;
use wolflog::record::LogRecord;

/// WolfLog - chunked transaction-file diagnostics
#[derive(Parser)]
#[command(name = "wolflog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database directory (when no configuration file is given)
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recompute the checksum of every completed chunk
    Verify,

    /// Show checkpoints and chunks
    Inspect {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print records
    Dump {
        /// Log position to start from
        #[arg(long, default_value_t = 0)]
        from: i64,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Write a configuration file for a database directory
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflog.toml")]
        output: PathBuf,

        /// Database directory
        #[arg(long)]
        db_path: PathBuf,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<i32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Verify => run_verify(load_config(&cli)?),
        Commands::Inspect { json } => run_inspect(load_config(&cli)?, json),
        Commands::Dump { from, limit } => run_dump(load_config(&cli)?, from, limit),
        Commands::Init {
            output,
            db_path,
            chunk_size,
        } => run_init(output, db_path, chunk_size),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Configuration from `--config`, or defaults for `--path` with the chunk
/// size taken from the chunk files
fn load_config(cli: &Cli) -> Result<DbConfig> {
    if let Some(config_path) = &cli.config {
        return DbConfig::from_file(config_path).map_err(|e| {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            e
        });
    }
    let Some(path) = &cli.path else {
        return Err(Error::Config(
            "either --config or --path is required".into(),
        ));
    };

    let mut config = DbConfig::default_for(path);
    if let Some(chunk_size) = detect_chunk_size(&config)? {
        config.chunk_size = chunk_size;
    }
    Ok(config)
}

fn detect_chunk_size(config: &DbConfig) -> Result<Option<i32>> {
    let naming = config.naming_strategy()?;
    for file in naming.all_present_files()? {
        if let Ok(info) = TfChunk::probe(&file) {
            tracing::debug!(
                "Using chunk size {} from {}",
                info.header.chunk_size,
                file.display()
            );
            return Ok(Some(info.header.chunk_size));
        }
    }
    Ok(None)
}

fn open_read_only(config: DbConfig) -> Result<Arc<TfChunkDb>> {
    let db = TfChunkDb::from_config(config)?;
    db.open(OpenOptions::read_only())?;
    Ok(Arc::new(db))
}

/// Verify every completed chunk
fn run_verify(config: DbConfig) -> Result<()> {
    let db = open_read_only(config)?;

    let mut failed = Vec::new();
    for chunk in db.manager().all_chunks() {
        if !chunk.is_completed() {
            println!("- {} (ongoing, skipped)", chunk.file_name());
            continue;
        }
        match chunk.verify_file_hash() {
            Ok(()) => println!("✓ {}", chunk.file_name()),
            Err(e) => {
                println!("✗ {}: {}", chunk.file_name(), e);
                failed.push(chunk.file_name());
            }
        }
    }
    db.close()?;

    if failed.is_empty() {
        println!("All chunks verified");
        Ok(())
    } else {
        Err(CorruptionError::HashValidation(failed.join(", ")).into())
    }
}

#[derive(Serialize)]
struct CheckpointReport {
    writer: i64,
    chaser: i64,
    epoch: i64,
    truncate: i64,
    replication: i64,
}

#[derive(Serialize)]
struct ChunkReport {
    file: String,
    chunk_start_number: i32,
    chunk_end_number: i32,
    chunk_id: String,
    scavenged: bool,
    completed: bool,
    physical_data_size: i64,
    logical_data_size: i64,
    records: i32,
}

#[derive(Serialize)]
struct DbReport {
    path: PathBuf,
    chunk_size: i32,
    checkpoints: CheckpointReport,
    chunks: Vec<ChunkReport>,
}

/// Show checkpoints and chunks
fn run_inspect(config: DbConfig, json: bool) -> Result<()> {
    let db = open_read_only(config)?;
    let checkpoints = db.checkpoints();

    let report = DbReport {
        path: db.config().path.clone(),
        chunk_size: db.chunk_size(),
        checkpoints: CheckpointReport {
            writer: checkpoints.writer.read(),
            chaser: checkpoints.chaser.read(),
            epoch: checkpoints.epoch.read(),
            truncate: checkpoints.truncate.read(),
            replication: checkpoints.replication.read(),
        },
        chunks: db
            .manager()
            .all_chunks()
            .iter()
            .map(|chunk| {
                let header = chunk.header();
                ChunkReport {
                    file: chunk.file_name(),
                    chunk_start_number: header.chunk_start_number,
                    chunk_end_number: header.chunk_end_number,
                    chunk_id: header.chunk_id.to_string(),
                    scavenged: header.is_scavenged,
                    completed: chunk.is_completed(),
                    physical_data_size: chunk.physical_data_size(),
                    logical_data_size: chunk.logical_data_size(),
                    records: chunk.record_count(),
                }
            })
            .collect(),
    };
    db.close()?;

    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| Error::Internal(format!("JSON encoding failed: {}", e)))?;
        println!("{}", out);
        return Ok(());
    }

    println!("WolfLog Database");
    println!("================");
    println!();
    println!("Path:             {}", report.path.display());
    println!("Chunk Size:       {}", report.chunk_size);
    println!();
    println!("Checkpoints:");
    println!("  Writer:         {}", report.checkpoints.writer);
    println!("  Chaser:         {}", report.checkpoints.chaser);
    println!("  Epoch:          {}", report.checkpoints.epoch);
    println!("  Truncate:       {}", report.checkpoints.truncate);
    println!("  Replication:    {}", report.checkpoints.replication);
    println!();
    println!("Chunks:");
    for chunk in &report.chunks {
        let state = match (chunk.completed, chunk.scavenged) {
            (_, true) => "scavenged",
            (true, false) => "completed",
            (false, false) => "ongoing",
        };
        println!(
            "  {:<22} #{}-{}  {:<9}  data {:>10}  logical {:>10}  records {}",
            chunk.file,
            chunk.chunk_start_number,
            chunk.chunk_end_number,
            state,
            chunk.physical_data_size,
            chunk.logical_data_size,
            chunk.records
        );
    }
    Ok(())
}

/// Print records from a log position
fn run_dump(config: DbConfig, from: i64, limit: Option<usize>) -> Result<()> {
    let db = open_read_only(config)?;
    let mut reader = TfChunkReader::new(Arc::clone(&db), Arc::clone(&db.checkpoints().writer), from)?;

    let mut count = 0;
    while limit.map_or(true, |limit| count < limit) {
        let Some(read) = reader.try_read_next()? else {
            break;
        };
        println!("{}", describe(read.position, &read.record));
        count += 1;
    }
    drop(reader);
    db.close()?;

    tracing::info!("Dumped {} record(s)", count);
    Ok(())
}

fn describe(position: i64, record: &LogRecord) -> String {
    match record {
        LogRecord::Prepare(p) => format!(
            "{:>12}  PREPARE  {}  {}  {}  tx={} flags={:?} data={}B meta={}B",
            position,
            p.timestamp.to_rfc3339(),
            p.event_stream_id,
            p.event_type,
            p.transaction_position,
            p.flags,
            p.data.len(),
            p.metadata.len()
        ),
        LogRecord::Commit(c) => format!(
            "{:>12}  COMMIT   {}  tx={} first_event={}",
            position,
            c.timestamp.to_rfc3339(),
            c.transaction_position,
            c.first_event_number
        ),
    }
}

/// Write a configuration file
fn run_init(output: PathBuf, db_path: PathBuf, chunk_size: Option<i32>) -> Result<()> {
    let mut config = DbConfig::default_for(db_path);
    if let Some(chunk_size) = chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    config.validate()?;

    let content = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("cannot encode configuration: {}", e)))?;
    write_new_file(&output, &format!("# WolfLog Configuration\n\n{}", content))?;

    println!("✓ Configuration written to {}", output.display());
    Ok(())
}

fn write_new_file(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        return Err(Error::Config(format!(
            "{} already exists, not overwriting",
            path.display()
        )));
    }
    std::fs::write(path, content)?;
    Ok(())
}
