//! Checkpoints
//!
//! Named, durable 64-bit position markers. `write` only changes the
//! in-memory value; `flush` persists it and publishes it to subscribers.
//! Readers of another process (or a freshly opened handle) only ever see
//! flushed values.

mod store;

pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MmapCheckpointStore};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;

/// Well-known checkpoint names
pub mod names {
    pub const WRITER: &str = "writer";
    pub const CHASER: &str = "chaser";
    pub const EPOCH: &str = "epoch";
    pub const TRUNCATE: &str = "truncate";
    pub const REPLICATION: &str = "replication";
}

/// Sentinel for "no pending truncation"
pub const NO_TRUNCATION: i64 = -1;

/// How checkpoint values are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Buffered file, fsync on flush
    #[default]
    File,
    /// Memory-mapped file, msync on flush
    Mmap,
    /// Process memory only
    Memory,
}

/// A named position marker with explicit write/flush separation
pub struct Checkpoint {
    name: String,
    last: AtomicI64,
    last_flushed: AtomicI64,
    store: Mutex<Box<dyn CheckpointStore>>,
    notify: watch::Sender<i64>,
}

impl Checkpoint {
    /// Build a checkpoint over any storage backend.
    ///
    /// The backend's persisted value wins over `default`; a backend that has
    /// never been written is initialised with `default` and synced.
    pub fn with_store(
        name: impl Into<String>,
        mut store: Box<dyn CheckpointStore>,
        default: i64,
    ) -> Result<Self> {
        let value = match store.load()? {
            Some(value) => value,
            None => {
                store.store(default)?;
                store.sync()?;
                default
            }
        };

        let (notify, _) = watch::channel(value);
        Ok(Self {
            name: name.into(),
            last: AtomicI64::new(value),
            last_flushed: AtomicI64::new(value),
            store: Mutex::new(store),
            notify,
        })
    }

    /// Open a buffered-file checkpoint
    pub fn open_file(path: &Path, name: impl Into<String>, default: i64) -> Result<Self> {
        Self::with_store(name, Box::new(FileCheckpointStore::open(path)?), default)
    }

    /// Open a memory-mapped checkpoint
    pub fn open_mmap(path: &Path, name: impl Into<String>, default: i64) -> Result<Self> {
        Self::with_store(name, Box::new(MmapCheckpointStore::open(path)?), default)
    }

    /// Create an in-memory checkpoint
    pub fn in_memory(name: impl Into<String>, initial: i64) -> Self {
        let (notify, _) = watch::channel(initial);
        Self {
            name: name.into(),
            last: AtomicI64::new(initial),
            last_flushed: AtomicI64::new(initial),
            store: Mutex::new(Box::new(MemoryCheckpointStore::new(initial))),
            notify,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Update the in-memory value; not durable until `flush`
    pub fn write(&self, value: i64) {
        self.last.store(value, Ordering::SeqCst);
    }

    /// Persist the last written value and publish it
    pub fn flush(&self) -> Result<()> {
        let mut store = self.store.lock();
        let value = self.last.load(Ordering::SeqCst);
        if value == self.last_flushed.load(Ordering::SeqCst) {
            return Ok(());
        }

        store.store(value)?;
        store.sync()?;
        self.last_flushed.store(value, Ordering::SeqCst);
        drop(store);

        self.notify.send_replace(value);
        Ok(())
    }

    /// Latest written value, flushed or not
    pub fn read(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Latest durable value
    pub fn read_flushed(&self) -> i64 {
        self.last_flushed.load(Ordering::SeqCst)
    }

    /// Receive every flushed value
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.notify.subscribe()
    }

    /// Flush (optionally) and release the backend
    pub fn close(&self, flush: bool) -> Result<()> {
        if flush {
            self.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("name", &self.name)
            .field("value", &self.read())
            .field("flushed", &self.read_flushed())
            .finish()
    }
}

/// The checkpoints a database is opened with
#[derive(Debug, Clone)]
pub struct Checkpoints {
    pub writer: Arc<Checkpoint>,
    pub chaser: Arc<Checkpoint>,
    pub epoch: Arc<Checkpoint>,
    pub truncate: Arc<Checkpoint>,
    pub replication: Arc<Checkpoint>,
}

impl Checkpoints {
    /// Open every checkpoint as `<dir>/<name>.chk`
    pub fn open(dir: &Path, backend: CheckpointBackend) -> Result<Self> {
        let open = |name: &str, default: i64| -> Result<Arc<Checkpoint>> {
            let path = dir.join(format!("{}.chk", name));
            let checkpoint = match backend {
                CheckpointBackend::File => Checkpoint::open_file(&path, name, default)?,
                CheckpointBackend::Mmap => Checkpoint::open_mmap(&path, name, default)?,
                CheckpointBackend::Memory => Checkpoint::in_memory(name, default),
            };
            Ok(Arc::new(checkpoint))
        };

        Ok(Self {
            writer: open(names::WRITER, 0)?,
            chaser: open(names::CHASER, 0)?,
            epoch: open(names::EPOCH, NO_TRUNCATION)?,
            truncate: open(names::TRUNCATE, NO_TRUNCATION)?,
            replication: open(names::REPLICATION, NO_TRUNCATION)?,
        })
    }

    /// All-in-memory set with writer and chaser at zero
    pub fn in_memory() -> Self {
        Self::in_memory_at(0, 0)
    }

    /// All-in-memory set with the given writer and chaser positions
    pub fn in_memory_at(writer: i64, chaser: i64) -> Self {
        Self {
            writer: Arc::new(Checkpoint::in_memory(names::WRITER, writer)),
            chaser: Arc::new(Checkpoint::in_memory(names::CHASER, chaser)),
            epoch: Arc::new(Checkpoint::in_memory(names::EPOCH, NO_TRUNCATION)),
            truncate: Arc::new(Checkpoint::in_memory(names::TRUNCATE, NO_TRUNCATION)),
            replication: Arc::new(Checkpoint::in_memory(names::REPLICATION, NO_TRUNCATION)),
        }
    }

    /// Checkpoints that must never run ahead of the writer
    pub fn reader_checkpoints(&self) -> [&Arc<Checkpoint>; 2] {
        [&self.chaser, &self.epoch]
    }

    pub fn flush_all(&self) -> Result<()> {
        for checkpoint in [
            &self.writer,
            &self.chaser,
            &self.epoch,
            &self.truncate,
            &self.replication,
        ] {
            checkpoint.flush()?;
        }
        Ok(())
    }
}
