//! Transaction File Writer
//!
//! The single append path of a database. Records go into the current
//! chunk; a full chunk is completed and the next one created. The writer
//! checkpoint is written on every append but only flushed after the chunk
//! data is durable, so readers never see a position whose bytes could be
//! lost in a crash.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::chunk::{AppendResult, TfChunk};
use crate::db::TfChunkDb;
use crate::error::{Error, Result};
use crate::record::LogRecord;

/// Outcome of [`TfChunkWriter::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub written: bool,
    /// Log position the record was written at
    pub log_position: i64,
    /// Writer position after the call
    pub new_position: i64,
}

/// Appends records to the current chunk of a database
pub struct TfChunkWriter {
    db: Arc<TfChunkDb>,
    checkpoint: Arc<Checkpoint>,
    /// Index of the current chunk in the manager
    current: i32,
    position: i64,
    closed: bool,
}

impl TfChunkWriter {
    /// Position a writer at the writer checkpoint of an opened database
    pub fn open(db: Arc<TfChunkDb>) -> Result<Self> {
        if db.is_read_only() {
            return Err(Error::InvalidOperation(
                "cannot write to a database opened read-only".into(),
            ));
        }
        db.ensure_verified()?;
        let checkpoint = Arc::clone(&db.checkpoints().writer);
        let position = checkpoint.read();
        let current = (position / db.chunk_size() as i64) as i32;

        let manager = db.manager();
        let chunk = match manager.get_chunk(current) {
            Some(chunk) => chunk,
            None if current == manager.chunks_count() => manager.add_new_chunk()?,
            None => {
                return Err(Error::InvalidOperation(format!(
                    "no chunk for writer position {} (chunks: {})",
                    position,
                    manager.chunks_count()
                )))
            }
        };

        if chunk.is_read_only() {
            return Err(Error::InvalidOperation(format!(
                "writer position {} is inside read-only chunk {}",
                position,
                chunk.file_name()
            )));
        }
        let local = position - chunk.header().chunk_start_position();
        if local != chunk.physical_data_size() {
            return Err(Error::InvalidOperation(format!(
                "writer position {} does not match the end of chunk {} data ({})",
                position,
                chunk.file_name(),
                chunk.physical_data_size()
            )));
        }

        tracing::debug!("Writer opened at {} in chunk {}", position, chunk.file_name());
        Ok(Self {
            db,
            checkpoint,
            current,
            position,
            closed: false,
        })
    }

    /// Position the next record must carry
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn current_chunk(&self) -> Result<Arc<TfChunk>> {
        self.db.manager().get_chunk(self.current).ok_or_else(|| {
            Error::InvalidOperation(format!("current chunk #{} is gone", self.current))
        })
    }

    /// Append a record at the writer position. A full chunk is completed and
    /// the record retried once at the start of the next chunk.
    pub fn write(&mut self, record: &LogRecord) -> Result<WriteResult> {
        self.ensure_open()?;
        if record.log_position() != self.position {
            return Err(Error::InvalidArgument(format!(
                "record log position {} does not match writer position {}",
                record.log_position(),
                self.position
            )));
        }

        if let Some(result) = self.try_append(record)? {
            return Ok(result);
        }

        let chunk = self.current_chunk()?;
        if chunk.physical_data_size() == 0 {
            // Does not fit even an empty chunk
            return Ok(self.not_written(record.log_position()));
        }

        self.complete_chunk()?;
        let moved = relocate(record, self.position);
        match self.try_append(&moved)? {
            Some(result) => Ok(result),
            None => Ok(self.not_written(moved.log_position())),
        }
    }

    fn try_append(&mut self, record: &LogRecord) -> Result<Option<WriteResult>> {
        let chunk = self.current_chunk()?;
        match chunk.try_append(record)? {
            AppendResult::Appended { new_position, .. } => {
                self.position = chunk.header().chunk_start_position() + new_position;
                self.checkpoint.write(self.position);
                Ok(Some(WriteResult {
                    written: true,
                    log_position: record.log_position(),
                    new_position: self.position,
                }))
            }
            AppendResult::NotEnoughSpace => Ok(None),
        }
    }

    fn not_written(&self, log_position: i64) -> WriteResult {
        WriteResult {
            written: false,
            log_position,
            new_position: self.position,
        }
    }

    /// Make appended data durable, then publish it through the checkpoint
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.current_chunk()?.flush()?;
        self.checkpoint.flush()
    }

    /// Seal the current chunk and move on to a fresh one
    pub fn complete_chunk(&mut self) -> Result<()> {
        self.ensure_open()?;
        let chunk = self.current_chunk()?;
        chunk.flush()?;
        chunk.complete()?;
        self.db.manager().chunk_completed(&chunk);

        self.position = chunk.header().chunk_end_position();
        self.checkpoint.write(self.position);
        self.checkpoint.flush()?;

        let next = self.db.manager().add_new_chunk()?;
        self.current = next.header().chunk_start_number;
        Ok(())
    }

    /// Flush and stop writing
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        tracing::debug!("Writer closed at {}", self.position);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidOperation("writer is closed".into()));
        }
        Ok(())
    }
}

/// Move a record to another log position. A single-write prepare keeps its
/// transaction position pointing at itself.
fn relocate(record: &LogRecord, log_position: i64) -> LogRecord {
    match record {
        LogRecord::Prepare(p) if p.transaction_position == p.log_position => {
            let mut moved = p.clone();
            moved.log_position = log_position;
            moved.transaction_position = log_position;
            LogRecord::Prepare(moved)
        }
        _ => record.with_log_position(log_position),
    }
}

impl std::fmt::Debug for TfChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunkWriter")
            .field("current", &self.current)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}
