//! Chunk file footer and position map

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

const FLAG_COMPLETED: u8 = 0x01;
const FLAG_MAPPED: u8 = 0x02;

/// Fixed 128-byte footer written when a chunk is completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub is_mapped: bool,
    pub physical_data_size: i32,
    pub logical_data_size: i64,
    /// Position map size in bytes
    pub map_size: i32,
    pub record_count: i32,
    /// CRC32 of header, data, map and footer prefix
    pub checksum: u32,
}

impl ChunkFooter {
    pub const SIZE: usize = 128;
    pub const CHECKSUM_OFFSET: usize = Self::SIZE - 4;

    pub fn completed(physical_data_size: i32, record_count: i32) -> Self {
        Self {
            is_completed: true,
            is_mapped: false,
            physical_data_size,
            logical_data_size: physical_data_size as i64,
            map_size: 0,
            record_count,
            checksum: 0,
        }
    }

    pub fn mapped(
        physical_data_size: i32,
        logical_data_size: i64,
        map_entries: usize,
        record_count: i32,
    ) -> Self {
        Self {
            is_completed: true,
            is_mapped: true,
            physical_data_size,
            logical_data_size,
            map_size: (map_entries * PosMapEntry::SIZE) as i32,
            record_count,
            checksum: 0,
        }
    }

    pub fn map_entries(&self) -> usize {
        self.map_size as usize / PosMapEntry::SIZE
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut flags = 0;
        if self.is_completed {
            flags |= FLAG_COMPLETED;
        }
        if self.is_mapped {
            flags |= FLAG_MAPPED;
        }
        bytes[0] = flags;
        LittleEndian::write_i32(&mut bytes[1..5], self.physical_data_size);
        LittleEndian::write_i64(&mut bytes[5..13], self.logical_data_size);
        LittleEndian::write_i32(&mut bytes[13..17], self.map_size);
        LittleEndian::write_i32(&mut bytes[17..21], self.record_count);
        LittleEndian::write_u32(&mut bytes[Self::CHECKSUM_OFFSET..], self.checksum);
        bytes
    }

    /// Parse a footer; `file` only names the source in errors
    pub fn from_bytes(bytes: &[u8], file: &str) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::bad_chunk(format!("{}: footer too short", file)));
        }
        let footer = Self {
            is_completed: bytes[0] & FLAG_COMPLETED != 0,
            is_mapped: bytes[0] & FLAG_MAPPED != 0,
            physical_data_size: LittleEndian::read_i32(&bytes[1..5]),
            logical_data_size: LittleEndian::read_i64(&bytes[5..13]),
            map_size: LittleEndian::read_i32(&bytes[13..17]),
            record_count: LittleEndian::read_i32(&bytes[17..21]),
            checksum: LittleEndian::read_u32(&bytes[Self::CHECKSUM_OFFSET..Self::SIZE]),
        };

        if footer.is_completed
            && (footer.physical_data_size < 0
                || footer.map_size < 0
                || footer.map_size as usize % PosMapEntry::SIZE != 0
                || footer.logical_data_size < footer.physical_data_size as i64 && !footer.is_mapped)
        {
            return Err(Error::bad_chunk(format!(
                "{}: inconsistent footer (physical {}, logical {}, map {})",
                file, footer.physical_data_size, footer.logical_data_size, footer.map_size
            )));
        }
        Ok(footer)
    }
}

/// One position map entry: logical position (local to the chunk) to data offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PosMapEntry {
    pub log_pos: i64,
    pub actual_pos: i32,
}

impl PosMapEntry {
    pub const SIZE: usize = 12;

    pub fn new(log_pos: i64, actual_pos: i32) -> Self {
        Self {
            log_pos,
            actual_pos,
        }
    }

    pub fn encode_all(entries: &[PosMapEntry]) -> Vec<u8> {
        let mut bytes = vec![0u8; entries.len() * Self::SIZE];
        for (entry, slot) in entries.iter().zip(bytes.chunks_exact_mut(Self::SIZE)) {
            LittleEndian::write_i64(&mut slot[..8], entry.log_pos);
            LittleEndian::write_i32(&mut slot[8..], entry.actual_pos);
        }
        bytes
    }

    pub fn decode_all(bytes: &[u8], file: &str) -> Result<Vec<PosMapEntry>> {
        if bytes.len() % Self::SIZE != 0 {
            return Err(Error::bad_chunk(format!(
                "{}: position map of {} bytes is not a whole number of entries",
                file,
                bytes.len()
            )));
        }
        let entries: Vec<PosMapEntry> = bytes
            .chunks_exact(Self::SIZE)
            .map(|slot| PosMapEntry {
                log_pos: LittleEndian::read_i64(&slot[..8]),
                actual_pos: LittleEndian::read_i32(&slot[8..]),
            })
            .collect();

        if entries.windows(2).any(|w| w[0].log_pos >= w[1].log_pos) {
            return Err(Error::bad_chunk(format!(
                "{}: position map is not sorted",
                file
            )));
        }
        Ok(entries)
    }
}
