//! WolfLog Error Types

use thiserror::Error;

/// Result type alias for WolfLog operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Argument errors (raised at the API boundary)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Argument out of range: {name} = {value}")]
    OutOfRange { name: &'static str, value: i64 },

    // Chunk state errors
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Chunk file is being deleted: {0}")]
    FileBeingDeleted(String),

    #[error("Checksum mismatch in {file}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    // Record codec errors
    #[error("Record error at position {position}: {reason}")]
    Record { position: i64, reason: String },

    // Database corruption (fatal at startup)
    #[error("Corrupt database: {0}")]
    CorruptDatabase(#[from] CorruptionError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Reasons a database directory fails startup validation.
///
/// Every variant is fatal: the host must refuse to serve.
#[derive(Error, Debug)]
pub enum CorruptionError {
    #[error("Bad chunk in database: {0}")]
    BadChunkInDatabase(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Extraneous file found: {0}")]
    ExtraneousFileFound(String),

    #[error("Checkpoint '{0}' is higher than the writer checkpoint")]
    ReaderCheckpointHigherThanWriter(String),

    #[error("Chunk file '{file}' has version {version}, expected {expected}")]
    WrongFileVersion {
        file: String,
        version: u8,
        expected: u8,
    },

    #[error("Hash validation failed: {0}")]
    HashValidation(String),
}

impl Error {
    /// Shorthand for a bad-chunk corruption error
    pub fn bad_chunk(msg: impl Into<String>) -> Self {
        Error::CorruptDatabase(CorruptionError::BadChunkInDatabase(msg.into()))
    }

    /// Shorthand for a missing-chunk corruption error
    pub fn chunk_not_found(file: impl Into<String>) -> Self {
        Error::CorruptDatabase(CorruptionError::ChunkNotFound(file.into()))
    }

    pub(crate) fn record(position: i64, reason: impl Into<String>) -> Self {
        Error::Record {
            position,
            reason: reason.into(),
        }
    }

    /// Check if this error means the database must not be served
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptDatabase(_) | Error::ChecksumMismatch { .. }
        )
    }

    /// The corruption cause, if this is a corruption error
    pub fn corruption(&self) -> Option<&CorruptionError> {
        match self {
            Error::CorruptDatabase(inner) => Some(inner),
            _ => None,
        }
    }
}
