//! Chunk arena
//!
//! Owns every open chunk, indexed by logical chunk number. A merged
//! (scavenged) chunk occupies every slot it covers.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::chunk::TfChunk;
use crate::error::{Error, Result};
use crate::naming::FileNamingStrategy;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Chunk lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A new ongoing chunk was created
    Created { chunk_number: i32 },
    /// A chunk was sealed
    Completed { chunk_start_number: i32, chunk_end_number: i32 },
    /// A merged chunk replaced the chunks it covers
    Switched {
        chunk_start_number: i32,
        chunk_end_number: i32,
        file: PathBuf,
    },
    /// A chunk left the database; its file goes once its readers finish
    Deleted { file: PathBuf },
}

/// The open chunks of a database
pub struct ChunkManager {
    naming: Arc<dyn FileNamingStrategy>,
    chunk_size: i32,
    cached_chunks: usize,
    cache_everything: bool,
    chunks: RwLock<Vec<Arc<TfChunk>>>,
    events: broadcast::Sender<ChunkEvent>,
}

impl ChunkManager {
    pub fn new(
        naming: Arc<dyn FileNamingStrategy>,
        chunk_size: i32,
        cached_chunks: usize,
        cache_everything: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            naming,
            chunk_size,
            cached_chunks,
            cache_everything,
            chunks: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn naming(&self) -> &Arc<dyn FileNamingStrategy> {
        &self.naming
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    /// Number of logical chunk slots
    pub fn chunks_count(&self) -> i32 {
        self.chunks.read().len() as i32
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChunkEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ChunkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register an opened chunk as the next slot(s)
    pub fn add_chunk(&self, chunk: TfChunk) -> Result<Arc<TfChunk>> {
        let chunk = Arc::new(chunk);
        {
            let mut chunks = self.chunks.write();
            let header = chunk.header();
            if header.chunk_start_number != chunks.len() as i32 {
                return Err(Error::InvalidOperation(format!(
                    "chunk #{}-{} added out of order, expected #{}",
                    header.chunk_start_number,
                    header.chunk_end_number,
                    chunks.len()
                )));
            }
            if header.chunk_size != self.chunk_size {
                return Err(Error::bad_chunk(format!(
                    "{}: chunk size {} does not match database chunk size {}",
                    chunk.file_name(),
                    header.chunk_size,
                    self.chunk_size
                )));
            }
            for _ in header.chunk_start_number..=header.chunk_end_number {
                chunks.push(Arc::clone(&chunk));
            }
        }
        self.update_cache();
        Ok(chunk)
    }

    /// Create and register a fresh ongoing chunk at the next index
    pub fn add_new_chunk(&self) -> Result<Arc<TfChunk>> {
        let chunk_number = self.chunks_count();
        let path = self.naming.filename_for(chunk_number, 0)?;
        let chunk = TfChunk::create_new(path, self.chunk_size, chunk_number, chunk_number, false)?;
        let chunk = self.add_chunk(chunk)?;

        tracing::info!("Created new chunk #{} ({})", chunk_number, chunk.file_name());
        self.publish(ChunkEvent::Created { chunk_number });
        Ok(chunk)
    }

    pub fn get_chunk(&self, chunk_number: i32) -> Option<Arc<TfChunk>> {
        if chunk_number < 0 {
            return None;
        }
        self.chunks.read().get(chunk_number as usize).cloned()
    }

    pub fn get_chunk_for(&self, log_position: i64) -> Option<Arc<TfChunk>> {
        if log_position < 0 {
            return None;
        }
        let chunk_number = log_position / self.chunk_size as i64;
        if chunk_number > i32::MAX as i64 {
            return None;
        }
        self.get_chunk(chunk_number as i32)
    }

    pub fn last_chunk(&self) -> Option<Arc<TfChunk>> {
        self.chunks.read().last().cloned()
    }

    /// Every distinct chunk, oldest first
    pub fn all_chunks(&self) -> Vec<Arc<TfChunk>> {
        let chunks = self.chunks.read();
        let mut distinct: Vec<Arc<TfChunk>> = Vec::new();
        for chunk in chunks.iter() {
            if distinct.last().map_or(true, |last| !Arc::ptr_eq(last, chunk)) {
                distinct.push(Arc::clone(chunk));
            }
        }
        distinct
    }

    /// Called when the writer seals a chunk
    pub(crate) fn chunk_completed(&self, chunk: &TfChunk) {
        let header = chunk.header();
        self.publish(ChunkEvent::Completed {
            chunk_start_number: header.chunk_start_number,
            chunk_end_number: header.chunk_end_number,
        });
        self.update_cache();
    }

    /// Install a completed temp chunk (scavenge output) in place of the
    /// chunks it covers. The file moves to the next version of its start
    /// index; replaced chunks are marked for deletion.
    pub fn switch_chunk(&self, chunk: TfChunk, verify_hash: bool) -> Result<Arc<TfChunk>> {
        if !chunk.is_completed() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is not completed and cannot be switched in",
                chunk.file_name()
            )));
        }
        let start = chunk.header().chunk_start_number;
        let end = chunk.header().chunk_end_number;
        self.check_replaceable(start, end)?;

        let version = match self.naming.all_versions_for(start)?.first() {
            Some(newest) => self.naming.version_for(newest).unwrap_or(0) + 1,
            None => 1,
        };
        let new_path = self.naming.filename_for(start, version)?;
        if new_path.exists() {
            // Legacy names carry no version: the rename would land on a file
            // that is deleted right after
            return Err(Error::InvalidOperation(format!(
                "cannot install a new version of chunk #{}: {} already exists",
                start,
                new_path.display()
            )));
        }
        let old_path = chunk.path().to_path_buf();

        tracing::info!(
            "Switching chunk #{}-{}: {} -> {}",
            start,
            end,
            chunk.file_name(),
            new_path.display()
        );
        chunk.dispose();
        drop(chunk);
        std::fs::rename(&old_path, &new_path)?;

        let new_chunk = Arc::new(TfChunk::from_completed_file(&new_path, verify_hash)?);

        let mut replaced: Vec<Arc<TfChunk>> = Vec::new();
        {
            let mut chunks = self.chunks.write();
            // re-checked under the write lock
            for index in start..=end {
                let slot = chunks.get_mut(index as usize).ok_or_else(|| {
                    Error::InvalidOperation(format!("chunk #{} disappeared during switch", index))
                })?;
                let old = std::mem::replace(slot, Arc::clone(&new_chunk));
                if replaced.last().map_or(true, |last| !Arc::ptr_eq(last, &old)) {
                    replaced.push(old);
                }
            }
        }

        self.publish(ChunkEvent::Switched {
            chunk_start_number: start,
            chunk_end_number: end,
            file: new_path,
        });
        for old in replaced {
            tracing::info!("Old chunk {} is marked for deletion", old.file_name());
            old.mark_for_deletion();
            self.publish(ChunkEvent::Deleted {
                file: old.path().to_path_buf(),
            });
        }

        self.update_cache();
        Ok(new_chunk)
    }

    fn check_replaceable(&self, start: i32, end: i32) -> Result<()> {
        let chunks = self.chunks.read();
        if start < 0 || end as usize >= chunks.len() {
            return Err(Error::InvalidOperation(format!(
                "chunk range #{}-{} is outside the database (chunks: {})",
                start,
                end,
                chunks.len()
            )));
        }
        let mut index = start;
        while index <= end {
            let old = &chunks[index as usize];
            let header = old.header();
            if header.chunk_start_number < start || header.chunk_end_number > end {
                return Err(Error::InvalidOperation(format!(
                    "chunk range #{}-{} does not line up with existing chunk #{}-{}",
                    start, end, header.chunk_start_number, header.chunk_end_number
                )));
            }
            if !old.is_completed() {
                return Err(Error::InvalidOperation(format!(
                    "chunk {} is still being written",
                    old.file_name()
                )));
            }
            index = header.chunk_end_number + 1;
        }
        Ok(())
    }

    /// Cache the most recent completed chunks, uncache the rest
    pub fn update_cache(&self) {
        let chunks = self.all_chunks();
        let mut to_cache = if self.cache_everything {
            usize::MAX
        } else {
            self.cached_chunks
        };

        for chunk in chunks.iter().rev() {
            if !chunk.is_completed() {
                continue;
            }
            if to_cache > 0 {
                if let Err(e) = chunk.cache_in_memory() {
                    tracing::warn!("Failed to cache chunk {}: {}", chunk.file_name(), e);
                }
                to_cache -= 1;
            } else {
                chunk.uncache_from_memory();
            }
        }
    }

    /// Release every chunk. Returns `false` (closing nothing) while any
    /// chunk is still being read.
    pub fn try_close(&self) -> bool {
        let chunks = self.all_chunks();
        if let Some(busy) = chunks.iter().find(|c| c.readers_count() > 0) {
            tracing::debug!("Chunk {} still has readers, not closing", busy.file_name());
            return false;
        }
        for chunk in &chunks {
            chunk.dispose();
        }
        self.chunks.write().clear();
        true
    }
}

impl std::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkManager")
            .field("path", &self.naming.path())
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.chunks_count())
            .finish()
    }
}
