//! Transaction File Readers
//!
//! [`TfChunkReader`] reads records by log position, forwards and backwards.
//! [`TfChunkSequentialReader`] streams raw frames through a bounded buffer
//! and is what chasers are built on. Both stop at the flushed writer
//! checkpoint: bytes that are not durable yet are never returned.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::chunk::{ChunkReadHandle, TfChunk};
use crate::db::TfChunkDb;
use crate::error::{Error, Result};
use crate::record::{self, LogRecord, FRAME_OVERHEAD, LENGTH_SIZE};

/// Default size of the sequential reader's buffer
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Attempts to find a live chunk while scavenges swap them out
const SWITCH_RETRIES: usize = 3;

/// A record together with where it sits in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub record: LogRecord,
    /// Log position of the record
    pub position: i64,
    /// Reader position after the read: past the record going forward, at
    /// the record going backward
    pub next_position: i64,
}

/// Pin the chunk holding `position`, retrying when it is being replaced
fn pin_chunk(db: &TfChunkDb, position: i64) -> Result<ChunkReadHandle> {
    for _ in 0..SWITCH_RETRIES {
        let chunk = db.manager().get_chunk_for(position).ok_or_else(|| {
            Error::InvalidOperation(format!("no chunk holds log position {}", position))
        })?;
        match chunk.acquire_reader() {
            Ok(handle) => return Ok(handle),
            Err(Error::FileBeingDeleted(file)) => {
                tracing::debug!("Chunk {} is being replaced, looking again", file);
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::FileBeingDeleted(format!(
        "chunk for log position {}",
        position
    )))
}

fn is_mapped(chunk: &TfChunk) -> bool {
    chunk.footer().map_or(false, |f| f.is_mapped)
}

/// Record-level reader with a current position
pub struct TfChunkReader {
    db: Arc<TfChunkDb>,
    writer: Arc<Checkpoint>,
    position: i64,
}

impl TfChunkReader {
    pub fn new(db: Arc<TfChunkDb>, writer: Arc<Checkpoint>, start: i64) -> Result<Self> {
        if start < 0 {
            return Err(Error::OutOfRange {
                name: "start",
                value: start,
            });
        }
        Ok(Self {
            db,
            writer,
            position: start,
        })
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) -> Result<()> {
        if position < 0 {
            return Err(Error::OutOfRange {
                name: "position",
                value: position,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Record starting exactly at `position`; the reader does not move
    pub fn try_read_at(&self, position: i64) -> Result<Option<ReadRecord>> {
        let limit = self.writer.read_flushed();
        if position < 0 || position >= limit {
            return Ok(None);
        }
        let handle = pin_chunk(&self.db, position)?;
        let start = handle.chunk().header().chunk_start_position();
        let result = handle.try_read_at(position - start)?;
        Ok(result.record.and_then(|record| {
            let next_position = start + result.next_position;
            (next_position <= limit).then_some(ReadRecord {
                record,
                position,
                next_position,
            })
        }))
    }

    /// Next record at or after the reader position
    pub fn try_read_next(&mut self) -> Result<Option<ReadRecord>> {
        loop {
            let limit = self.writer.read_flushed();
            let position = self.position;
            if position >= limit {
                return Ok(None);
            }

            let handle = pin_chunk(&self.db, position)?;
            let chunk = handle.chunk();
            let start = chunk.header().chunk_start_position();
            let result = handle.try_read_closest_forward(position - start)?;

            match result.record {
                Some(record) => {
                    let next_position = start + result.next_position;
                    if next_position > limit && !is_mapped(chunk) {
                        return Ok(None);
                    }
                    let record_position = if is_mapped(chunk) {
                        record.log_position()
                    } else {
                        position
                    };
                    self.position = next_position;
                    return Ok(Some(ReadRecord {
                        record,
                        position: record_position,
                        next_position,
                    }));
                }
                None if chunk.is_completed() => {
                    self.position = chunk.header().chunk_end_position();
                }
                None => return Ok(None),
            }
        }
    }

    /// Closest record ending at or before the reader position
    pub fn try_read_prev(&mut self) -> Result<Option<ReadRecord>> {
        loop {
            let position = self.position.min(self.writer.read_flushed());
            if position <= 0 {
                return Ok(None);
            }

            // A position on a chunk boundary belongs to the chunk before it
            let handle = pin_chunk(&self.db, position - 1)?;
            let chunk = handle.chunk();
            let start = chunk.header().chunk_start_position();
            let local = (position - start).min(chunk.logical_data_size());
            let result = handle.try_read_closest_backward(local)?;

            match result.record {
                Some(record) => {
                    let record_position = start + result.next_position;
                    self.position = record_position;
                    return Ok(Some(ReadRecord {
                        record,
                        position: record_position,
                        next_position: record_position,
                    }));
                }
                None if start == 0 => return Ok(None),
                None => self.position = start,
            }
        }
    }
}

impl std::fmt::Debug for TfChunkReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunkReader")
            .field("position", &self.position)
            .finish()
    }
}

/// Raw bytes of one chunk's data, starting at a data offset
struct Block {
    chunk_start_number: i32,
    offset: i64,
    len: usize,
}

/// Forward-only reader that pulls frame bytes through a fixed buffer.
///
/// Frames split across buffer refills, and frames larger than the buffer,
/// are reassembled before parsing.
pub struct TfChunkSequentialReader {
    db: Arc<TfChunkDb>,
    writer: Arc<Checkpoint>,
    position: i64,
    buffer: Vec<u8>,
    block: Option<Block>,
}

impl TfChunkSequentialReader {
    pub fn new(db: Arc<TfChunkDb>, writer: Arc<Checkpoint>, start: i64) -> Result<Self> {
        Self::with_buffer_size(db, writer, start, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        db: Arc<TfChunkDb>,
        writer: Arc<Checkpoint>,
        start: i64,
        buffer_size: usize,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("buffer size must be positive".into()));
        }
        if start < 0 {
            return Err(Error::OutOfRange {
                name: "start",
                value: start,
            });
        }
        Ok(Self {
            db,
            writer,
            position: start,
            buffer: vec![0u8; buffer_size],
            block: None,
        })
    }

    pub(crate) fn db(&self) -> &TfChunkDb {
        &self.db
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) -> Result<()> {
        if position < 0 {
            return Err(Error::OutOfRange {
                name: "position",
                value: position,
            });
        }
        self.position = position;
        self.block = None;
        Ok(())
    }

    /// Next durable record, or `None` when caught up with the writer
    pub fn try_read_next(&mut self) -> Result<Option<ReadRecord>> {
        loop {
            let limit = self.writer.read_flushed();
            let position = self.position;
            if position >= limit {
                return Ok(None);
            }

            let handle = pin_chunk(&self.db, position)?;
            let chunk = Arc::clone(handle.chunk());
            let header = chunk.header();
            let start = header.chunk_start_position();

            if is_mapped(&chunk) {
                let result = handle.try_read_closest_forward(position - start)?;
                match result.record {
                    Some(record) => {
                        let next_position = start + result.next_position;
                        self.position = next_position;
                        return Ok(Some(ReadRecord {
                            position: record.log_position(),
                            record,
                            next_position,
                        }));
                    }
                    None => {
                        self.position = header.chunk_end_position();
                        continue;
                    }
                }
            }

            let data_size = chunk.physical_data_size();
            let local = position - start;
            let readable = data_size.min(limit - start);
            if local + LENGTH_SIZE as i64 > readable {
                if chunk.is_completed() && local >= data_size {
                    self.position = header.chunk_end_position();
                    self.block = None;
                    continue;
                }
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_SIZE];
            self.copy(&handle, local, &mut prefix)?;
            let length = record::read_frame_length(&prefix, position)?;
            let total = (length + FRAME_OVERHEAD) as i64;
            if local + total > readable {
                if local + total > data_size && chunk.is_completed() {
                    return Err(Error::record(
                        position,
                        format!("record of {} bytes runs past the end of chunk data", length),
                    ));
                }
                return Ok(None);
            }

            let mut frame = vec![0u8; total as usize];
            self.copy(&handle, local, &mut frame)?;
            let record = LogRecord::parse_frame(&frame)?;
            self.position = position + total;
            return Ok(Some(ReadRecord {
                record,
                position,
                next_position: self.position,
            }));
        }
    }

    /// Fill `out` with chunk data from `offset`, refilling the buffer as
    /// often as needed
    fn copy(&mut self, handle: &ChunkReadHandle, offset: i64, out: &mut [u8]) -> Result<()> {
        let chunk_number = handle.chunk().header().chunk_start_number;
        let mut done = 0;
        while done < out.len() {
            let at = offset + done as i64;
            let hit = self
                .block
                .as_ref()
                .filter(|b| {
                    b.chunk_start_number == chunk_number
                        && at >= b.offset
                        && at < b.offset + b.len as i64
                })
                .map(|b| (b.offset, b.len));
            let (block_offset, block_len) = match hit {
                Some(found) => found,
                None => {
                    let len = handle.read_data(at, &mut self.buffer)?;
                    if len == 0 {
                        return Err(Error::record(
                            handle.chunk().header().chunk_start_position() + at,
                            "chunk data ended inside a record",
                        ));
                    }
                    self.block = Some(Block {
                        chunk_start_number: chunk_number,
                        offset: at,
                        len,
                    });
                    (at, len)
                }
            };
            let from = (at - block_offset) as usize;
            let n = (block_len - from).min(out.len() - done);
            out[done..done + n].copy_from_slice(&self.buffer[from..from + n]);
            done += n;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TfChunkSequentialReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunkSequentialReader")
            .field("position", &self.position)
            .field("buffer_size", &self.buffer.len())
            .finish()
    }
}
