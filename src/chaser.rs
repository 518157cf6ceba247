//! Chaser
//!
//! A sequential reader whose progress is itself a checkpoint. Index and
//! replication consumers follow the log with it: every record read moves
//! the chaser checkpoint, which is persisted on `flush`.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::db::TfChunkDb;
use crate::error::{Error, Result};
use crate::reader::{ReadRecord, TfChunkSequentialReader, DEFAULT_BUFFER_SIZE};

/// Follows the flushed writer checkpoint
pub struct TfChunkChaser {
    reader: TfChunkSequentialReader,
    writer: Arc<Checkpoint>,
    chaser: Arc<Checkpoint>,
}

impl TfChunkChaser {
    pub fn new(
        db: Arc<TfChunkDb>,
        writer: Arc<Checkpoint>,
        chaser: Arc<Checkpoint>,
    ) -> Result<Self> {
        Self::with_buffer_size(db, writer, chaser, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        db: Arc<TfChunkDb>,
        writer: Arc<Checkpoint>,
        chaser: Arc<Checkpoint>,
        buffer_size: usize,
    ) -> Result<Self> {
        let start = chaser.read();
        let reader =
            TfChunkSequentialReader::with_buffer_size(db, Arc::clone(&writer), start, buffer_size)?;
        Ok(Self {
            reader,
            writer,
            chaser,
        })
    }

    /// Resume from the chaser checkpoint
    pub fn open(&mut self) -> Result<()> {
        self.reader.db().ensure_verified()?;
        let start = self.chaser.read();
        if start > self.writer.read_flushed() {
            return Err(Error::InvalidOperation(format!(
                "chaser checkpoint {} is ahead of the writer ({})",
                start,
                self.writer.read_flushed()
            )));
        }
        self.reader.reposition(start)?;
        tracing::debug!("Chaser opened at {}", start);
        Ok(())
    }

    pub fn position(&self) -> i64 {
        self.reader.position()
    }

    /// Next durable record, or `None` when caught up
    pub fn try_read_next(&mut self) -> Result<Option<ReadRecord>> {
        let read = self.reader.try_read_next()?;
        if let Some(record) = &read {
            self.chaser.write(record.next_position);
        }
        Ok(read)
    }

    /// Wait for the next record. Dropping the future leaves the chaser
    /// where it was.
    pub async fn read_next(&mut self) -> Result<ReadRecord> {
        let mut flushed = self.writer.subscribe();
        loop {
            if let Some(record) = self.try_read_next()? {
                return Ok(record);
            }
            flushed.changed().await.map_err(|_| {
                Error::InvalidOperation("writer checkpoint was dropped".into())
            })?;
        }
    }

    /// Persist the chaser position
    pub fn flush(&self) -> Result<()> {
        self.chaser.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        tracing::debug!("Chaser closed at {}", self.chaser.read());
        Ok(())
    }
}

impl std::fmt::Debug for TfChunkChaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunkChaser")
            .field("position", &self.position())
            .field("chaser", &self.chaser.read())
            .field("writer", &self.writer.read_flushed())
            .finish()
    }
}
