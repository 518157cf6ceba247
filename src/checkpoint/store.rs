//! Checkpoint storage backends
//!
//! Every backend persists a single 8-byte little-endian cell.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Size of the persisted checkpoint cell
pub const CHECKPOINT_CELL_SIZE: u64 = 8;

/// Persistence mechanism behind a [`Checkpoint`](super::Checkpoint)
pub trait CheckpointStore: Send + 'static {
    /// Persisted value, or `None` for a freshly created cell
    fn load(&mut self) -> Result<Option<i64>>;

    /// Write the value into the cell (durability comes from `sync`)
    fn store(&mut self, value: i64) -> Result<()>;

    /// Make the last stored value durable
    fn sync(&mut self) -> Result<()>;
}

fn open_cell(path: &Path) -> Result<(File, bool)> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let len = file.metadata()?.len();
    if len != 0 && len != CHECKPOINT_CELL_SIZE {
        return Err(Error::InvalidOperation(format!(
            "Checkpoint file {} has size {}, expected {}",
            path.display(),
            len,
            CHECKPOINT_CELL_SIZE
        )));
    }
    Ok((file, len == 0))
}

/// Buffered file with fsync on flush
pub struct FileCheckpointStore {
    path: PathBuf,
    file: File,
    fresh: bool,
}

impl FileCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        let (file, fresh) = open_cell(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            fresh,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&mut self) -> Result<Option<i64>> {
        if self.fresh {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(0))?;
        Ok(Some(self.file.read_i64::<LittleEndian>()?))
    }

    fn store(&mut self, value: i64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<LittleEndian>(value)?;
        self.fresh = false;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Memory-mapped file with msync on flush
pub struct MmapCheckpointStore {
    mmap: MmapMut,
    fresh: bool,
}

impl MmapCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        let (file, fresh) = open_cell(path)?;
        if fresh {
            file.set_len(CHECKPOINT_CELL_SIZE)?;
        }
        // SAFETY: the cell is owned by a single writer per checkpoint name;
        // other handles only map it to read flushed values.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { mmap, fresh })
    }
}

impl CheckpointStore for MmapCheckpointStore {
    fn load(&mut self) -> Result<Option<i64>> {
        if self.fresh {
            return Ok(None);
        }
        Ok(Some(LittleEndian::read_i64(&self.mmap[..8])))
    }

    fn store(&mut self, value: i64) -> Result<()> {
        LittleEndian::write_i64(&mut self.mmap[..8], value);
        self.fresh = false;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Process-local cell
pub struct MemoryCheckpointStore {
    value: i64,
}

impl MemoryCheckpointStore {
    pub fn new(value: i64) -> Self {
        Self { value }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&mut self) -> Result<Option<i64>> {
        Ok(Some(self.value))
    }

    fn store(&mut self, value: i64) -> Result<()> {
        self.value = value;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
