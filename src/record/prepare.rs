//! Prepare records: a proposed event write

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{write_bytes, write_string, write_timestamp, RecordReader};
use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Prepare record flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PrepareFlags: u16 {
        /// Record carries event data
        const DATA = 0x01;
        /// First record of a transaction
        const TRANSACTION_BEGIN = 0x02;
        /// Last record of a transaction
        const TRANSACTION_END = 0x04;
        /// Record deletes the stream
        const STREAM_DELETE = 0x08;
        /// Committed on write; no commit record follows
        const IS_COMMITTED = 0x20;
        /// Data and metadata are JSON
        const IS_JSON = 0x100;

        const SINGLE_WRITE = Self::DATA.bits()
            | Self::TRANSACTION_BEGIN.bits()
            | Self::TRANSACTION_END.bits();
    }
}

/// Expected version sentinels
pub mod expected_version {
    pub const ANY: i64 = -2;
    pub const NO_STREAM: i64 = -1;
}

/// A proposed event write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareLogRecord {
    pub log_position: i64,
    pub flags: PrepareFlags,
    pub transaction_position: i64,
    pub transaction_offset: i32,
    pub expected_version: i64,
    pub event_stream_id: String,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl PrepareLogRecord {
    /// A self-contained, already committed single event write
    #[allow(clippy::too_many_arguments)]
    pub fn single_write(
        log_position: i64,
        correlation_id: Uuid,
        event_id: Uuid,
        event_stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Self {
        Self {
            log_position,
            flags: PrepareFlags::SINGLE_WRITE | PrepareFlags::IS_COMMITTED,
            transaction_position: log_position,
            transaction_offset: 0,
            expected_version,
            event_stream_id: event_stream_id.into(),
            event_id,
            correlation_id,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            data,
            metadata,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_position < 0 {
            return Err(Error::OutOfRange {
                name: "log_position",
                value: self.log_position,
            });
        }
        if self.transaction_position < 0 {
            return Err(Error::OutOfRange {
                name: "transaction_position",
                value: self.transaction_position,
            });
        }
        if self.transaction_offset < -1 {
            return Err(Error::OutOfRange {
                name: "transaction_offset",
                value: self.transaction_offset as i64,
            });
        }
        if self.expected_version < expected_version::ANY {
            return Err(Error::OutOfRange {
                name: "expected_version",
                value: self.expected_version,
            });
        }
        if self.event_stream_id.is_empty() {
            return Err(Error::InvalidArgument(
                "event_stream_id cannot be empty".into(),
            ));
        }
        if self.correlation_id.is_nil() || self.event_id.is_nil() {
            return Err(Error::InvalidArgument(
                "event_id and correlation_id must not be nil".into(),
            ));
        }
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    pub(super) fn write_fields(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<LittleEndian>(self.flags.bits())?;
        out.write_i64::<LittleEndian>(self.transaction_position)?;
        out.write_i32::<LittleEndian>(self.transaction_offset)?;
        out.write_i64::<LittleEndian>(self.expected_version)?;
        write_string(out, &self.event_stream_id)?;
        out.extend_from_slice(self.event_id.as_bytes());
        out.extend_from_slice(self.correlation_id.as_bytes());
        write_timestamp(out, &self.timestamp)?;
        write_string(out, &self.event_type)?;
        write_bytes(out, &self.data)?;
        write_bytes(out, &self.metadata)?;
        Ok(())
    }

    pub(super) fn read_fields(log_position: i64, r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self {
            log_position,
            flags: PrepareFlags::from_bits_retain(r.u16()?),
            transaction_position: r.i64()?,
            transaction_offset: r.i32()?,
            expected_version: r.i64()?,
            event_stream_id: r.string()?,
            event_id: r.uuid()?,
            correlation_id: r.uuid()?,
            timestamp: r.timestamp()?,
            event_type: r.string()?,
            data: r.bytes()?,
            metadata: r.bytes()?,
        })
    }
}
