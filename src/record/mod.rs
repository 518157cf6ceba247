//! Log Records
//!
//! The two record kinds stored in the transaction file and their binary
//! framing. Every record is stored as
//!
//! ```text
//! [length: i32][type: u8][version: u8][log_position: i64][fields...][length: i32]
//! ```
//!
//! The duplicated length lets readers scan in both directions and detect
//! truncated frames immediately.

mod commit;
mod prepare;

pub use commit::CommitLogRecord;
pub use prepare::{expected_version, PrepareFlags, PrepareLogRecord};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Cursor, Read};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Size of the length prefix (and of the suffix)
pub const LENGTH_SIZE: usize = 4;

/// Prefix plus suffix
pub const FRAME_OVERHEAD: usize = 2 * LENGTH_SIZE;

/// Largest record body accepted by the codec
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Current record format version
pub const LOG_RECORD_VERSION: u8 = 1;

/// Record type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    Prepare = 0,
    Commit = 1,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(LogRecordType::Prepare),
            1 => Ok(LogRecordType::Commit),
            other => Err(other),
        }
    }
}

/// A record in the transaction file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareLogRecord),
    Commit(CommitLogRecord),
}

impl LogRecord {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            LogRecord::Prepare(_) => LogRecordType::Prepare,
            LogRecord::Commit(_) => LogRecordType::Commit,
        }
    }

    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
        }
    }

    /// Copy of this record placed at another log position
    pub fn with_log_position(&self, log_position: i64) -> LogRecord {
        match self {
            LogRecord::Prepare(p) => LogRecord::Prepare(PrepareLogRecord {
                log_position,
                ..p.clone()
            }),
            LogRecord::Commit(c) => LogRecord::Commit(CommitLogRecord {
                log_position,
                ..c.clone()
            }),
        }
    }

    /// Reject records a caller should never have built
    pub fn validate(&self) -> Result<()> {
        match self {
            LogRecord::Prepare(p) => p.validate(),
            LogRecord::Commit(c) => c.validate(),
        }
    }

    /// Serialize the record body (no length prefix/suffix)
    pub fn write_body(&self, out: &mut Vec<u8>) -> Result<()> {
        self.validate()?;
        out.push(self.record_type() as u8);
        out.push(LOG_RECORD_VERSION);
        out.write_i64::<LittleEndian>(self.log_position())?;
        match self {
            LogRecord::Prepare(p) => p.write_fields(out)?,
            LogRecord::Commit(c) => c.write_fields(out)?,
        }
        Ok(())
    }

    /// Serialize the record with its length prefix and suffix
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(128);
        frame.extend_from_slice(&[0u8; LENGTH_SIZE]);
        self.write_body(&mut frame)?;

        let length = frame.len() - LENGTH_SIZE;
        if length > MAX_RECORD_SIZE {
            return Err(Error::record(
                self.log_position(),
                format!("record of {} bytes exceeds the {} byte limit", length, MAX_RECORD_SIZE),
            ));
        }
        LittleEndian::write_i32(&mut frame[..LENGTH_SIZE], length as i32);
        frame.write_i32::<LittleEndian>(length as i32)?;
        Ok(frame)
    }

    /// Bytes the record occupies on disk, framing included
    pub fn size_on_disk(&self) -> Result<usize> {
        Ok(self.to_frame()?.len())
    }

    /// Parse a record body
    pub fn parse(body: &[u8]) -> Result<LogRecord> {
        let mut r = RecordReader::new(body, -1);
        let record_type = r.u8()?;
        let version = r.u8()?;
        let log_position = r.i64()?;
        r.position = log_position;

        if version != LOG_RECORD_VERSION {
            return Err(Error::record(
                log_position,
                format!("unsupported record version {}", version),
            ));
        }

        let record = match LogRecordType::try_from(record_type) {
            Ok(LogRecordType::Prepare) => {
                LogRecord::Prepare(PrepareLogRecord::read_fields(log_position, &mut r)?)
            }
            Ok(LogRecordType::Commit) => {
                LogRecord::Commit(CommitLogRecord::read_fields(log_position, &mut r)?)
            }
            Err(other) => {
                return Err(Error::record(
                    log_position,
                    format!("unknown record type {}", other),
                ))
            }
        };

        if r.remaining() != 0 {
            return Err(Error::record(
                log_position,
                format!("{} trailing bytes after record", r.remaining()),
            ));
        }
        Ok(record)
    }

    /// Parse a complete frame, checking prefix and suffix agree
    pub fn parse_frame(frame: &[u8]) -> Result<LogRecord> {
        let length = read_frame_length(frame, -1)?;
        if frame.len() != length + FRAME_OVERHEAD {
            return Err(Error::record(
                -1,
                format!("frame of {} bytes declares length {}", frame.len(), length),
            ));
        }
        let suffix = LittleEndian::read_i32(&frame[frame.len() - LENGTH_SIZE..]);
        if suffix as usize != length {
            return Err(Error::record(
                -1,
                format!("length prefix {} does not match suffix {}", length, suffix),
            ));
        }
        Self::parse(&frame[LENGTH_SIZE..LENGTH_SIZE + length])
    }
}

/// Read and sanity check a length prefix/suffix
pub fn read_frame_length(bytes: &[u8], position: i64) -> Result<usize> {
    if bytes.len() < LENGTH_SIZE {
        return Err(Error::record(position, "not enough bytes for a length field"));
    }
    let length = LittleEndian::read_i32(&bytes[..LENGTH_SIZE]);
    if length <= 0 || length as usize > MAX_RECORD_SIZE {
        return Err(Error::record(
            position,
            format!("invalid record length {}", length),
        ));
    }
    Ok(length as usize)
}

pub(crate) fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(value.len() as u32)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    out.write_i32::<LittleEndian>(value.len() as i32)?;
    out.extend_from_slice(value);
    Ok(())
}

pub(crate) fn write_timestamp(out: &mut Vec<u8>, value: &DateTime<Utc>) -> Result<()> {
    out.write_i64::<LittleEndian>(value.timestamp())?;
    out.write_u32::<LittleEndian>(value.timestamp_subsec_nanos())?;
    Ok(())
}

/// Field reader that reports failures against the record's log position
pub(crate) struct RecordReader<'a> {
    cursor: Cursor<&'a [u8]>,
    position: i64,
}

impl<'a> RecordReader<'a> {
    fn new(bytes: &'a [u8], position: i64) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            position,
        }
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    fn truncated(&self) -> Error {
        Error::record(self.position, "record body is truncated")
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| self.truncated())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        self.cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| self.truncated())
    }

    pub(crate) fn uuid(&mut self) -> Result<Uuid> {
        let mut bytes = [0u8; 16];
        self.cursor
            .read_exact(&mut bytes)
            .map_err(|_| self.truncated())?;
        Ok(Uuid::from_bytes(bytes))
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.remaining() {
            return Err(self.truncated());
        }
        let mut bytes = vec![0u8; len];
        self.cursor
            .read_exact(&mut bytes)
            .map_err(|_| self.truncated())?;
        Ok(bytes)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::record(self.position, "string field is not valid UTF-8"))
    }

    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.i32()?;
        if len < 0 {
            return Err(Error::record(
                self.position,
                format!("negative payload length {}", len),
            ));
        }
        self.take(len as usize)
    }

    pub(crate) fn timestamp(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.i64()?;
        let nanos = self.u32()?;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| Error::record(self.position, "timestamp out of range"))
    }
}
