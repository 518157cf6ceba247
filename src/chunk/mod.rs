//! Transaction File Chunks
//!
//! A chunk is one file of the transaction log:
//!
//! ```text
//! [header 128][framed records][zero padding][footer 128]        (ongoing)
//! [header 128][framed records][position map][footer 128]        (completed)
//! ```
//!
//! Ongoing chunks are preallocated to `header + chunk_size + footer` and are
//! appended to by a single writer. Completing a chunk writes the footer right
//! after the data (and the position map, for scavenged chunks) and trims the
//! file. From then on its bytes are immutable.
//!
//! Positions taken and returned by the read API are local logical positions,
//! i.e. relative to the chunk's start position.

mod footer;
mod header;

pub use footer::{ChunkFooter, PosMapEntry};
pub use header::{ChunkHeader, CHUNK_VERSION, FILE_TYPE_CHUNK};

use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::MAX_CHUNK_SIZE;
use crate::error::{CorruptionError, Error, Result};
use crate::record::{self, LogRecord, FRAME_OVERHEAD, LENGTH_SIZE};

const HEADER_SIZE: u64 = ChunkHeader::SIZE as u64;
const FOOTER_SIZE: u64 = ChunkFooter::SIZE as u64;
const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Outcome of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Written between the two local positions
    Appended { old_position: i64, new_position: i64 },
    /// The chunk cannot hold the record; nothing was written
    NotEnoughSpace,
}

impl AppendResult {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendResult::Appended { .. })
    }
}

/// Outcome of a chunk read. A missing record is a normal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReadResult {
    /// Where to continue: after the record for forward reads, at the
    /// record for backward reads
    pub next_position: i64,
    pub record: Option<LogRecord>,
}

impl RecordReadResult {
    pub fn found(record: LogRecord, next_position: i64) -> Self {
        Self {
            next_position,
            record: Some(record),
        }
    }

    pub fn failure() -> Self {
        Self {
            next_position: -1,
            record: None,
        }
    }

    pub fn success(&self) -> bool {
        self.record.is_some()
    }
}

/// Header and (possibly zeroed) trailing footer of a chunk file
#[derive(Debug, Clone)]
pub struct ChunkFileInfo {
    pub header: ChunkHeader,
    pub footer: ChunkFooter,
    pub file_len: u64,
}

struct WriterState {
    file: File,
    hasher: crc32fast::Hasher,
    record_count: i32,
}

/// Snapshot of what readers may see
struct DataView {
    data_size: i64,
    logical_size: i64,
    map: Option<Arc<Vec<PosMapEntry>>>,
}

/// One chunk file of the transaction log
pub struct TfChunk {
    path: PathBuf,
    header: ChunkHeader,
    footer: RwLock<Option<ChunkFooter>>,
    pos_map: RwLock<Arc<Vec<PosMapEntry>>>,
    /// Physical bytes of record data written so far
    data_size: AtomicI64,
    capacity: i64,
    writer: Mutex<Option<WriterState>>,
    read_files: Mutex<Vec<File>>,
    cache: RwLock<Option<Arc<Vec<u8>>>>,
    readers: AtomicUsize,
    pending_delete: AtomicBool,
    deleted: AtomicBool,
    closed: AtomicBool,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn data_capacity(header: &ChunkHeader) -> i64 {
    if header.is_scavenged {
        (header.chunk_size as i64 * header.span() as i64).min(MAX_CHUNK_SIZE as i64)
    } else {
        header.chunk_size as i64
    }
}

impl TfChunk {
    fn build(
        path: PathBuf,
        header: ChunkHeader,
        footer: Option<ChunkFooter>,
        pos_map: Vec<PosMapEntry>,
        data_size: i64,
        writer: Option<WriterState>,
    ) -> Self {
        let capacity = data_capacity(&header);
        Self {
            path,
            header,
            footer: RwLock::new(footer),
            pos_map: RwLock::new(Arc::new(pos_map)),
            data_size: AtomicI64::new(data_size),
            capacity,
            writer: Mutex::new(writer),
            read_files: Mutex::new(Vec::new()),
            cache: RwLock::new(None),
            readers: AtomicUsize::new(0),
            pending_delete: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new, empty chunk file
    pub fn create_new(
        path: impl Into<PathBuf>,
        chunk_size: i32,
        chunk_start_number: i32,
        chunk_end_number: i32,
        is_scavenged: bool,
    ) -> Result<Self> {
        let path = path.into();
        if chunk_size <= 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::OutOfRange {
                name: "chunk_size",
                value: chunk_size as i64,
            });
        }
        if chunk_start_number < 0 || chunk_end_number < chunk_start_number {
            return Err(Error::InvalidArgument(format!(
                "invalid chunk range {}-{}",
                chunk_start_number, chunk_end_number
            )));
        }

        let header = ChunkHeader::new(chunk_size, chunk_start_number, chunk_end_number, is_scavenged);
        let header_bytes = header.to_bytes();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        // Scavenged chunks are trimmed on completion anyway
        if !is_scavenged {
            file.set_len(HEADER_SIZE + chunk_size as u64 + FOOTER_SIZE)?;
        }
        file.write_all(&header_bytes)?;
        file.sync_data()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);

        tracing::debug!(
            "Created chunk {} ({}-{}, scavenged: {})",
            display_name(&path),
            chunk_start_number,
            chunk_end_number,
            is_scavenged
        );

        Ok(Self::build(
            path,
            header,
            None,
            Vec::new(),
            0,
            Some(WriterState {
                file,
                hasher,
                record_count: 0,
            }),
        ))
    }

    /// Read the header and trailing footer of a chunk file
    pub fn probe(path: &Path) -> Result<ChunkFileInfo> {
        let name = display_name(path);
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::chunk_not_found(name.clone()),
            _ => Error::Io(e),
        })?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::bad_chunk(format!(
                "{}: file is too short ({} bytes)",
                name, file_len
            )));
        }

        let mut buf = [0u8; ChunkHeader::SIZE];
        file.read_exact(&mut buf)?;
        let header = ChunkHeader::from_bytes(&buf, &name)?;
        if header.version != CHUNK_VERSION {
            return Err(CorruptionError::WrongFileVersion {
                file: name,
                version: header.version,
                expected: CHUNK_VERSION,
            }
            .into());
        }

        let mut buf = [0u8; ChunkFooter::SIZE];
        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE))?;
        file.read_exact(&mut buf)?;
        let footer = ChunkFooter::from_bytes(&buf, &name)?;

        Ok(ChunkFileInfo {
            header,
            footer,
            file_len,
        })
    }

    /// Open a completed (immutable) chunk
    pub fn from_completed_file(path: impl Into<PathBuf>, verify_hash: bool) -> Result<Self> {
        let path = path.into();
        let name = display_name(&path);
        let info = Self::probe(&path)?;
        let footer = info.footer;

        if !footer.is_completed {
            return Err(Error::bad_chunk(format!("{}: chunk is not completed", name)));
        }
        let expected_len =
            HEADER_SIZE + footer.physical_data_size as u64 + footer.map_size as u64 + FOOTER_SIZE;
        if info.file_len != expected_len {
            return Err(Error::bad_chunk(format!(
                "{}: file length {} does not match footer (expected {})",
                name, info.file_len, expected_len
            )));
        }
        if footer.is_mapped != info.header.is_scavenged {
            return Err(Error::bad_chunk(format!(
                "{}: scavenged flag does not match position map",
                name
            )));
        }

        let pos_map = if footer.map_size > 0 {
            let mut file = File::open(&path)?;
            let mut bytes = vec![0u8; footer.map_size as usize];
            file.seek(SeekFrom::Start(HEADER_SIZE + footer.physical_data_size as u64))?;
            file.read_exact(&mut bytes)?;
            PosMapEntry::decode_all(&bytes, &name)?
        } else {
            Vec::new()
        };

        let data_size = footer.physical_data_size as i64;
        let chunk = Self::build(path, info.header, Some(footer), pos_map, data_size, None);
        if verify_hash {
            chunk.verify_file_hash()?;
        }
        Ok(chunk)
    }

    /// Reopen an ongoing chunk for appending at a local position
    pub fn from_ongoing_file(path: impl Into<PathBuf>, write_position: i64) -> Result<Self> {
        let path = path.into();
        let name = display_name(&path);
        let info = Self::probe(&path)?;
        let header = info.header;

        if info.footer.is_completed {
            return Err(Error::bad_chunk(format!(
                "{}: chunk is completed, cannot append",
                name
            )));
        }
        if header.is_scavenged {
            return Err(Error::bad_chunk(format!(
                "{}: scavenged chunk cannot be ongoing",
                name
            )));
        }
        let expected_len = HEADER_SIZE + header.chunk_size as u64 + FOOTER_SIZE;
        if info.file_len != expected_len {
            return Err(Error::bad_chunk(format!(
                "{}: ongoing chunk has length {}, expected {}",
                name, info.file_len, expected_len
            )));
        }
        if write_position < 0 || write_position > header.chunk_size as i64 {
            return Err(Error::bad_chunk(format!(
                "{}: write position {} is outside the chunk",
                name, write_position
            )));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let chunk = Self::build(path, header, None, Vec::new(), write_position, None);

        // Rebuild the running checksum over what is already there
        let mut hasher = crc32fast::Hasher::new();
        chunk.hash_range(&mut hasher, 0, HEADER_SIZE + write_position as u64)?;
        let record_count = chunk.count_frames(write_position)?;

        *chunk.writer.lock() = Some(WriterState {
            file,
            hasher,
            record_count,
        });
        Ok(chunk)
    }

    // ---- accessors ------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        self.footer.read().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.footer.read().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.lock().is_none()
    }

    pub fn pos_map(&self) -> Arc<Vec<PosMapEntry>> {
        self.pos_map.read().clone()
    }

    pub fn physical_data_size(&self) -> i64 {
        self.data_size.load(Ordering::SeqCst)
    }

    /// Logical bytes covered by the chunk's data
    pub fn logical_data_size(&self) -> i64 {
        self.view().logical_size
    }

    /// Room left for appends
    pub fn remaining_space(&self) -> i64 {
        self.capacity - self.physical_data_size()
    }

    pub fn record_count(&self) -> i32 {
        if let Some(footer) = self.footer.read().as_ref() {
            return footer.record_count;
        }
        self.writer.lock().as_ref().map_or(0, |w| w.record_count)
    }

    pub fn is_cached(&self) -> bool {
        self.cache.read().is_some()
    }

    pub fn readers_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.pending_delete.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn read_only_error(&self) -> Error {
        Error::InvalidOperation(format!("chunk {} is read-only", self.file_name()))
    }

    // ---- writing --------------------------------------------------------

    /// Append a framed record at the current write position
    pub fn try_append(&self, record: &LogRecord) -> Result<AppendResult> {
        let frame = record.to_frame()?;
        self.append_bytes(&frame, 1)
    }

    /// Append pre-framed bytes verbatim
    pub fn append_raw(&self, bytes: &[u8]) -> Result<AppendResult> {
        self.append_bytes(bytes, 0)
    }

    fn append_bytes(&self, bytes: &[u8], records: i32) -> Result<AppendResult> {
        let mut writer = self.writer.lock();
        let state = writer.as_mut().ok_or_else(|| self.read_only_error())?;

        let old_position = self.data_size.load(Ordering::SeqCst);
        let new_position = old_position + bytes.len() as i64;
        if new_position > self.capacity {
            return Ok(AppendResult::NotEnoughSpace);
        }

        state
            .file
            .seek(SeekFrom::Start(HEADER_SIZE + old_position as u64))?;
        state.file.write_all(bytes)?;
        state.hasher.update(bytes);
        state.record_count += records;
        self.data_size.store(new_position, Ordering::SeqCst);

        Ok(AppendResult::Appended {
            old_position,
            new_position,
        })
    }

    /// Make every appended byte durable
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let state = writer.as_mut().ok_or_else(|| self.read_only_error())?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Seal a regular chunk
    pub fn complete(&self) -> Result<()> {
        if self.header.is_scavenged {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is scavenged; complete it with a position map",
                self.file_name()
            )));
        }
        let physical = self.physical_data_size() as i32;
        let record_count = self.record_count();
        self.write_footer(ChunkFooter::completed(physical, record_count), Vec::new())
    }

    /// Seal a scavenged chunk together with its position map
    pub fn complete_scavenge(&self, pos_map: Vec<PosMapEntry>) -> Result<()> {
        if !self.header.is_scavenged {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is not scavenged",
                self.file_name()
            )));
        }
        if pos_map.windows(2).any(|w| w[0].log_pos >= w[1].log_pos) {
            return Err(Error::InvalidArgument(
                "position map must be sorted by log position".into(),
            ));
        }
        let physical = self.physical_data_size() as i32;
        let logical = self.header.chunk_end_position() - self.header.chunk_start_position();
        let footer = ChunkFooter::mapped(physical, logical, pos_map.len(), pos_map.len() as i32);
        self.write_footer(footer, pos_map)
    }

    fn write_footer(&self, mut footer: ChunkFooter, pos_map: Vec<PosMapEntry>) -> Result<()> {
        let mut writer = self.writer.lock();
        let state = writer.as_mut().ok_or_else(|| self.read_only_error())?;

        let map_bytes = PosMapEntry::encode_all(&pos_map);
        state.hasher.update(&map_bytes);
        state
            .hasher
            .update(&footer.to_bytes()[..ChunkFooter::CHECKSUM_OFFSET]);
        footer.checksum = state.hasher.clone().finalize();

        let offset = HEADER_SIZE + footer.physical_data_size as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&map_bytes)?;
        state.file.write_all(&footer.to_bytes())?;
        state
            .file
            .set_len(offset + map_bytes.len() as u64 + FOOTER_SIZE)?;
        state.file.sync_all()?;

        tracing::info!(
            "Completed chunk {} (data: {} bytes, records: {}, map entries: {})",
            self.file_name(),
            footer.physical_data_size,
            footer.record_count,
            pos_map.len()
        );

        *self.pos_map.write() = Arc::new(pos_map);
        *self.footer.write() = Some(footer);
        *writer = None;
        Ok(())
    }

    // ---- caching --------------------------------------------------------

    /// Serve reads of a completed chunk from memory. Returns whether the
    /// chunk is now cached.
    pub fn cache_in_memory(&self) -> Result<bool> {
        if !self.is_completed() || self.is_marked_for_deletion() || self.closed.load(Ordering::SeqCst)
        {
            return Ok(false);
        }
        if self.is_cached() {
            return Ok(true);
        }
        let bytes = std::fs::read(&self.path)?;
        *self.cache.write() = Some(Arc::new(bytes));
        tracing::debug!("Cached chunk {} in memory", self.file_name());
        Ok(true)
    }

    pub fn uncache_from_memory(&self) {
        if self.cache.write().take().is_some() {
            tracing::debug!("Uncached chunk {}", self.file_name());
        }
    }

    // ---- raw access -----------------------------------------------------

    fn take_read_file(&self) -> Result<File> {
        if self.closed.load(Ordering::SeqCst) || self.is_deleted() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is closed",
                self.file_name()
            )));
        }
        if let Some(file) = self.read_files.lock().pop() {
            return Ok(file);
        }
        Ok(File::open(&self.path)?)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let cache = self.cache.read().clone();
        if let Some(bytes) = cache {
            let start = offset as usize;
            let end = start + buf.len();
            if end <= bytes.len() {
                buf.copy_from_slice(&bytes[start..end]);
                return Ok(());
            }
        }

        let mut file = self.take_read_file()?;
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf));
        if result.is_ok() {
            self.read_files.lock().push(file);
        }
        result?;
        Ok(())
    }

    fn hash_range(&self, hasher: &mut crc32fast::Hasher, from: u64, to: u64) -> Result<()> {
        let mut buf = vec![0u8; HASH_BLOCK_SIZE];
        let mut offset = from;
        while offset < to {
            let len = ((to - offset) as usize).min(HASH_BLOCK_SIZE);
            self.read_exact_at(offset, &mut buf[..len])?;
            hasher.update(&buf[..len]);
            offset += len as u64;
        }
        Ok(())
    }

    fn count_frames(&self, data_size: i64) -> Result<i32> {
        let mut count = 0;
        let mut position = 0i64;
        let mut len_buf = [0u8; LENGTH_SIZE];
        while position + LENGTH_SIZE as i64 <= data_size {
            self.read_exact_at(HEADER_SIZE + position as u64, &mut len_buf)?;
            let Ok(length) = record::read_frame_length(&len_buf, position) else {
                break;
            };
            position += (length + FRAME_OVERHEAD) as i64;
            if position > data_size {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Recompute the checksum of a completed chunk and compare it to the footer
    pub fn verify_file_hash(&self) -> Result<()> {
        let footer = self.footer().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "chunk {} is not completed, nothing to verify",
                self.file_name()
            ))
        })?;

        let end = HEADER_SIZE
            + footer.physical_data_size as u64
            + footer.map_size as u64
            + ChunkFooter::CHECKSUM_OFFSET as u64;
        let mut hasher = crc32fast::Hasher::new();
        self.hash_range(&mut hasher, 0, end)?;

        let actual = hasher.finalize();
        if actual != footer.checksum {
            return Err(Error::ChecksumMismatch {
                file: self.file_name(),
                expected: footer.checksum,
                actual,
            });
        }
        Ok(())
    }

    // ---- reading --------------------------------------------------------

    fn view(&self) -> DataView {
        match self.footer.read().as_ref() {
            Some(footer) => DataView {
                data_size: footer.physical_data_size as i64,
                logical_size: footer.logical_data_size,
                map: footer.is_mapped.then(|| self.pos_map.read().clone()),
            },
            None => {
                let size = self.physical_data_size();
                DataView {
                    data_size: size,
                    logical_size: size,
                    // Positions of an unfinished scavenged chunk are not addressable yet
                    map: self.header.is_scavenged.then(|| Arc::new(Vec::new())),
                }
            }
        }
    }

    /// Read the frame at a data offset; `None` past the end of the data
    fn read_frame(&self, offset: i64, data_size: i64) -> Result<Option<(LogRecord, i64)>> {
        if offset < 0 || offset + LENGTH_SIZE as i64 > data_size {
            return Ok(None);
        }
        let base = self.header.chunk_start_position();

        let mut len_buf = [0u8; LENGTH_SIZE];
        self.read_exact_at(HEADER_SIZE + offset as u64, &mut len_buf)?;
        let length = record::read_frame_length(&len_buf, base + offset)?;
        let total = (length + FRAME_OVERHEAD) as i64;
        if offset + total > data_size {
            return Err(Error::record(
                base + offset,
                format!("record of {} bytes runs past the end of chunk data", length),
            ));
        }

        let mut frame = vec![0u8; total as usize];
        self.read_exact_at(HEADER_SIZE + offset as u64, &mut frame)?;
        let record = LogRecord::parse_frame(&frame)?;
        Ok(Some((record, total)))
    }

    fn read_mapped(&self, view: &DataView, map: &[PosMapEntry], index: usize) -> Result<RecordReadResult> {
        let entry = map[index];
        let next = map.get(index + 1).map_or(view.logical_size, |e| e.log_pos);
        match self.read_frame(entry.actual_pos as i64, view.data_size)? {
            Some((record, _)) => Ok(RecordReadResult::found(record, next)),
            None => Err(Error::bad_chunk(format!(
                "{}: position map points past the data ({})",
                self.file_name(),
                entry.actual_pos
            ))),
        }
    }

    fn read_at_inner(&self, position: i64) -> Result<RecordReadResult> {
        let view = self.view();
        match &view.map {
            Some(map) => match map.binary_search_by_key(&position, |e| e.log_pos) {
                Ok(index) => self.read_mapped(&view, map, index),
                Err(_) => Ok(RecordReadResult::failure()),
            },
            None => Ok(match self.read_frame(position, view.data_size)? {
                Some((record, len)) => RecordReadResult::found(record, position + len),
                None => RecordReadResult::failure(),
            }),
        }
    }

    fn read_closest_forward_inner(&self, position: i64) -> Result<RecordReadResult> {
        let view = self.view();
        match &view.map {
            Some(map) => {
                let index = map.partition_point(|e| e.log_pos < position);
                if index == map.len() {
                    return Ok(RecordReadResult::failure());
                }
                self.read_mapped(&view, map, index)
            }
            None => self.read_at_inner(position),
        }
    }

    fn read_closest_backward_inner(&self, position: i64) -> Result<RecordReadResult> {
        let view = self.view();
        match &view.map {
            Some(map) => {
                let index = map.partition_point(|e| e.log_pos < position);
                if index == 0 {
                    return Ok(RecordReadResult::failure());
                }
                let entry = map[index - 1];
                let mut result = self.read_mapped(&view, map, index - 1)?;
                result.next_position = entry.log_pos;
                Ok(result)
            }
            None => {
                if position <= 0 || position > view.data_size {
                    return Ok(RecordReadResult::failure());
                }
                if position < FRAME_OVERHEAD as i64 {
                    return Err(Error::record(
                        self.header.chunk_start_position() + position,
                        "no room for a record before this position",
                    ));
                }
                let mut len_buf = [0u8; LENGTH_SIZE];
                self.read_exact_at(
                    HEADER_SIZE + (position - LENGTH_SIZE as i64) as u64,
                    &mut len_buf,
                )?;
                let length = record::read_frame_length(
                    &len_buf,
                    self.header.chunk_start_position() + position,
                )?;
                let start = position - (length + FRAME_OVERHEAD) as i64;
                match self.read_frame(start, view.data_size)? {
                    Some((record, _)) => Ok(RecordReadResult::found(record, start)),
                    None => Err(Error::record(
                        self.header.chunk_start_position() + position,
                        "length suffix points before the chunk data",
                    )),
                }
            }
        }
    }

    fn read_last_inner(&self) -> Result<RecordReadResult> {
        let view = self.view();
        match &view.map {
            Some(map) if map.is_empty() => Ok(RecordReadResult::failure()),
            Some(map) => {
                let mut result = self.read_mapped(&view, map, map.len() - 1)?;
                result.next_position = map[map.len() - 1].log_pos;
                Ok(result)
            }
            None => self.read_closest_backward_inner(view.data_size),
        }
    }

    fn read_data_inner(&self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        let data_size = self.view().data_size;
        if offset < 0 || offset >= data_size {
            return Ok(0);
        }
        let len = ((data_size - offset) as usize).min(buf.len());
        self.read_exact_at(HEADER_SIZE + offset as u64, &mut buf[..len])?;
        Ok(len)
    }

    /// Record starting exactly at `position`
    pub fn try_read_at(&self, position: i64) -> Result<RecordReadResult> {
        let _guard = self.enter_read()?;
        self.read_at_inner(position)
    }

    pub fn try_read_first(&self) -> Result<RecordReadResult> {
        let _guard = self.enter_read()?;
        self.read_closest_forward_inner(0)
    }

    pub fn try_read_last(&self) -> Result<RecordReadResult> {
        let _guard = self.enter_read()?;
        self.read_last_inner()
    }

    /// First record at or after `position`
    pub fn try_read_closest_forward(&self, position: i64) -> Result<RecordReadResult> {
        let _guard = self.enter_read()?;
        self.read_closest_forward_inner(position)
    }

    /// Last record ending at or before `position`
    pub fn try_read_closest_backward(&self, position: i64) -> Result<RecordReadResult> {
        let _guard = self.enter_read()?;
        self.read_closest_backward_inner(position)
    }

    /// Copy raw record data starting at a data offset; returns bytes copied
    pub fn read_data(&self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.enter_read()?;
        self.read_data_inner(offset, buf)
    }

    // ---- lifetime -------------------------------------------------------

    fn register_reader(&self) -> Result<()> {
        if self.is_marked_for_deletion() {
            return Err(Error::FileBeingDeleted(self.file_name()));
        }
        self.readers.fetch_add(1, Ordering::SeqCst);
        if self.is_marked_for_deletion() {
            self.release_reader();
            return Err(Error::FileBeingDeleted(self.file_name()));
        }
        Ok(())
    }

    fn release_reader(&self) {
        let previous = self.readers.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.is_marked_for_deletion() {
            self.try_destroy();
        }
    }

    fn enter_read(&self) -> Result<ReadGuard<'_>> {
        self.register_reader()?;
        Ok(ReadGuard { chunk: self })
    }

    /// Pin the chunk for a sequence of reads
    pub fn acquire_reader(self: &Arc<Self>) -> Result<ChunkReadHandle> {
        self.register_reader()?;
        Ok(ChunkReadHandle {
            chunk: Arc::clone(self),
        })
    }

    /// Delete the file now if nobody reads it, otherwise when the last
    /// reader lets go
    pub fn mark_for_deletion(&self) {
        self.pending_delete.store(true, Ordering::SeqCst);
        self.uncache_from_memory();
        if self.readers.load(Ordering::SeqCst) == 0 {
            self.try_destroy();
        }
    }

    fn try_destroy(&self) {
        if self.readers.load(Ordering::SeqCst) != 0 || self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_files();
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Deleted chunk file {}", self.file_name()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete chunk file {}: {}", self.file_name(), e),
        }
    }

    fn release_files(&self) {
        *self.writer.lock() = None;
        self.read_files.lock().clear();
        *self.cache.write() = None;
    }

    /// Release every handle and cached byte without touching the file
    pub fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.release_files();
    }
}

impl std::fmt::Debug for TfChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunk")
            .field("file", &self.file_name())
            .field("start", &self.header.chunk_start_number)
            .field("end", &self.header.chunk_end_number)
            .field("scavenged", &self.header.is_scavenged)
            .field("completed", &self.is_completed())
            .field("data_size", &self.physical_data_size())
            .finish()
    }
}

struct ReadGuard<'a> {
    chunk: &'a TfChunk,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.chunk.release_reader();
    }
}

/// Keeps a chunk's file alive while held. Reads through the handle keep
/// working after the chunk is marked for deletion.
pub struct ChunkReadHandle {
    chunk: Arc<TfChunk>,
}

impl ChunkReadHandle {
    pub fn chunk(&self) -> &Arc<TfChunk> {
        &self.chunk
    }

    pub fn try_read_at(&self, position: i64) -> Result<RecordReadResult> {
        self.chunk.read_at_inner(position)
    }

    pub fn try_read_first(&self) -> Result<RecordReadResult> {
        self.chunk.read_closest_forward_inner(0)
    }

    pub fn try_read_last(&self) -> Result<RecordReadResult> {
        self.chunk.read_last_inner()
    }

    pub fn try_read_closest_forward(&self, position: i64) -> Result<RecordReadResult> {
        self.chunk.read_closest_forward_inner(position)
    }

    pub fn try_read_closest_backward(&self, position: i64) -> Result<RecordReadResult> {
        self.chunk.read_closest_backward_inner(position)
    }

    pub fn read_data(&self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        self.chunk.read_data_inner(offset, buf)
    }
}

impl Drop for ChunkReadHandle {
    fn drop(&mut self) {
        self.chunk.release_reader();
    }
}

impl std::fmt::Debug for ChunkReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChunkReadHandle").field(&self.chunk).finish()
    }
}
