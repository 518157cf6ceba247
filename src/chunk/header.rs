//! Chunk file header

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{Error, Result};

/// File type tag of a chunk file
pub const FILE_TYPE_CHUNK: u8 = 1;

/// Current chunk format version
pub const CHUNK_VERSION: u8 = 1;

/// Fixed 128-byte header at the start of every chunk file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    /// Logical bytes per chunk index
    pub chunk_size: i32,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub is_scavenged: bool,
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    pub const SIZE: usize = 128;

    pub fn new(chunk_size: i32, start: i32, end: i32, is_scavenged: bool) -> Self {
        Self {
            version: CHUNK_VERSION,
            chunk_size,
            chunk_start_number: start,
            chunk_end_number: end,
            is_scavenged,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Logical position of the first byte of this chunk
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Logical position just past the last chunk index covered
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Number of chunk indexes the file covers
    pub fn span(&self) -> i32 {
        self.chunk_end_number - self.chunk_start_number + 1
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = FILE_TYPE_CHUNK;
        bytes[1] = self.version;
        LittleEndian::write_i32(&mut bytes[2..6], self.chunk_size);
        LittleEndian::write_i32(&mut bytes[6..10], self.chunk_start_number);
        LittleEndian::write_i32(&mut bytes[10..14], self.chunk_end_number);
        bytes[14] = self.is_scavenged as u8;
        bytes[15..31].copy_from_slice(self.chunk_id.as_bytes());
        bytes
    }

    /// Parse a header; `file` only names the source in errors
    pub fn from_bytes(bytes: &[u8], file: &str) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::bad_chunk(format!("{}: header too short", file)));
        }
        if bytes[0] != FILE_TYPE_CHUNK {
            return Err(Error::bad_chunk(format!(
                "{}: not a chunk file (type tag {})",
                file, bytes[0]
            )));
        }

        let header = Self {
            version: bytes[1],
            chunk_size: LittleEndian::read_i32(&bytes[2..6]),
            chunk_start_number: LittleEndian::read_i32(&bytes[6..10]),
            chunk_end_number: LittleEndian::read_i32(&bytes[10..14]),
            is_scavenged: bytes[14] != 0,
            chunk_id: Uuid::from_slice(&bytes[15..31])
                .map_err(|e| Error::bad_chunk(format!("{}: {}", file, e)))?,
        };

        if header.chunk_size <= 0
            || header.chunk_start_number < 0
            || header.chunk_end_number < header.chunk_start_number
        {
            return Err(Error::bad_chunk(format!(
                "{}: inconsistent header (size {}, start {}, end {})",
                file, header.chunk_size, header.chunk_start_number, header.chunk_end_number
            )));
        }
        Ok(header)
    }
}
