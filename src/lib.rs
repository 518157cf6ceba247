//! WolfLog - Chunked Transaction File Engine
//!
//! The durable, append-only log underneath an event-sourced database. The
//! log is a sequence of framed Prepare and Commit records spread over
//! fixed-size chunk files, plus a handful of checkpoints that say how much
//! of it is durable and how far each consumer has read.
//!
//! # Architecture
//!
//! A single [`writer::TfChunkWriter`] appends to the current chunk and
//! advances the writer checkpoint once data is on disk. Readers and
//! chasers never look past that checkpoint. On startup
//! [`db::TfChunkDb::open`] validates every chunk file against the
//! checkpoints, applies a pending truncation and removes superseded files.
//!
//! # Features
//!
//! - Byte-exact chunk, record and checkpoint formats with CRC32 checksums
//! - Versioned chunk files replaced atomically by scavenge merges
//! - Reference-counted chunk readers with deferred file deletion
//! - Chasers that persist their own progress and can await new data
//! - File, memory-mapped and in-memory checkpoint backends

pub mod chaser;
pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod naming;
pub mod reader;
pub mod record;
pub mod scavenge;
pub mod writer;

pub use config::DbConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chaser::TfChunkChaser;
    pub use crate::checkpoint::{Checkpoint, Checkpoints};
    pub use crate::config::DbConfig;
    pub use crate::db::{ChunkEvent, OpenOptions, TfChunkDb};
    pub use crate::error::{CorruptionError, Error, Result};
    pub use crate::reader::{ReadRecord, TfChunkReader, TfChunkSequentialReader};
    pub use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};
    pub use crate::scavenge::{ChunkMerger, ScavengeResult};
    pub use crate::writer::{TfChunkWriter, WriteResult};
}
