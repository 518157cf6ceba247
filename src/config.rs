//! WolfLog Configuration
//!
//! Configuration for a chunked transaction-file database: where the chunks
//! live, how big they are, how they are named and how the checkpoints are
//! persisted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::{CheckpointBackend, Checkpoints};
use crate::chunk::{ChunkFooter, ChunkHeader};
use crate::naming::{FileNamingStrategy, PrefixFileNamingStrategy, VersionedPatternFileNamingStrategy};

/// Largest chunk size that still keeps every local position in 32 bits
pub const MAX_CHUNK_SIZE: i32 = i32::MAX - ChunkHeader::SIZE as i32 - ChunkFooter::SIZE as i32;

/// Main database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Directory holding chunk and checkpoint files
    pub path: PathBuf,

    /// Logical data bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i32,

    /// Chunk file name prefix
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Chunk file naming scheme
    #[serde(default)]
    pub naming: NamingScheme,

    /// Number of most recent completed chunks kept cached in memory
    #[serde(default = "default_cached_chunks")]
    pub cached_chunks: usize,

    /// How checkpoints are persisted
    #[serde(default)]
    pub checkpoint_backend: CheckpointBackend,

    /// Keep everything in memory (tests and throwaway nodes)
    #[serde(default)]
    pub in_memory: bool,

    /// Verify chunk checksums in the background after opening
    #[serde(default = "default_true")]
    pub verify_hash: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Chunk file naming scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NamingScheme {
    /// `<prefix><index:06>.<version:06>`
    #[default]
    Versioned,
    /// Legacy `<prefix><index>`
    Prefix,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_chunk_size() -> i32 {
    256 * 1024 * 1024
}

fn default_file_prefix() -> String {
    "chunk-".to_string()
}

fn default_cached_chunks() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DbConfig {
    /// Default configuration for a database rooted at `path`
    pub fn default_for(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: default_chunk_size(),
            file_prefix: default_file_prefix(),
            naming: NamingScheme::default(),
            cached_chunks: default_cached_chunks(),
            checkpoint_backend: CheckpointBackend::default(),
            in_memory: false,
            verify_hash: true,
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("path cannot be empty".into()));
        }

        if self.file_prefix.is_empty() {
            return Err(crate::Error::Config("file_prefix cannot be empty".into()));
        }

        if self.chunk_size <= 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(crate::Error::Config(format!(
                "chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }

        Ok(())
    }

    pub fn with_chunk_size(mut self, chunk_size: i32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_cached_chunks(mut self, cached_chunks: usize) -> Self {
        self.cached_chunks = cached_chunks;
        self
    }

    pub fn with_checkpoint_backend(mut self, backend: CheckpointBackend) -> Self {
        self.checkpoint_backend = backend;
        self
    }

    pub fn with_naming(mut self, naming: NamingScheme) -> Self {
        self.naming = naming;
        self
    }

    /// Build the naming strategy for chunk files
    pub fn naming_strategy(&self) -> crate::Result<Arc<dyn FileNamingStrategy>> {
        Ok(match self.naming {
            NamingScheme::Versioned => Arc::new(VersionedPatternFileNamingStrategy::new(
                &self.path,
                &self.file_prefix,
            )?),
            NamingScheme::Prefix => {
                Arc::new(PrefixFileNamingStrategy::new(&self.path, &self.file_prefix)?)
            }
        })
    }

    /// Get a checkpoint file path
    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{}.chk", name))
    }

    /// Open (or create) the well-known checkpoints for this database
    pub fn open_checkpoints(&self) -> crate::Result<Checkpoints> {
        if self.in_memory {
            return Ok(Checkpoints::in_memory());
        }
        std::fs::create_dir_all(&self.path)?;
        Checkpoints::open(&self.path, self.checkpoint_backend)
    }
}
