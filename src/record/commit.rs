//! Commit records: durability confirmation for a transaction

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{write_timestamp, RecordReader};
use crate::error::{Error, Result};

/// Commits the prepares written at `transaction_position`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    pub sort_key: i64,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl CommitLogRecord {
    pub fn new(
        log_position: i64,
        correlation_id: Uuid,
        transaction_position: i64,
        first_event_number: i64,
    ) -> Self {
        Self {
            log_position,
            transaction_position,
            first_event_number,
            sort_key: log_position,
            correlation_id,
            timestamp: Utc::now(),
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
        if self.first_event_number < 0 {
            return Err(Error::OutOfRange {
                name: "first_event_number",
                value: self.first_event_number,
            });
        }
        if self.correlation_id.is_nil() {
            return Err(Error::InvalidArgument(
                "correlation_id must not be nil".into(),
            ));
        }
        Ok(())
    }

    pub(super) fn write_fields(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i64::<LittleEndian>(self.transaction_position)?;
        out.write_i64::<LittleEndian>(self.first_event_number)?;
        out.write_i64::<LittleEndian>(self.sort_key)?;
        out.extend_from_slice(self.correlation_id.as_bytes());
        write_timestamp(out, &self.timestamp)?;
        Ok(())
    }

    pub(super) fn read_fields(log_position: i64, r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self {
            log_position,
            transaction_position: r.i64()?,
            first_event_number: r.i64()?,
            sort_key: r.i64()?,
            correlation_id: r.uuid()?,
            timestamp: r.timestamp()?,
        })
    }
}
