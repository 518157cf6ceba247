//! Chunked Transaction File Database
//!
//! Opens a database directory: validates the chunk files on disk against
//! the checkpoints, applies a pending truncation, cleans up superseded and
//! temporary files and hands the open chunks to a [`ChunkManager`].
//!
//! Every validation failure is a [`CorruptionError`] and must stop the host.

mod manager;
mod truncate;

pub use manager::{ChunkEvent, ChunkManager};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::broadcast;

use crate::checkpoint::Checkpoints;
use crate::chunk::{ChunkFileInfo, TfChunk};
use crate::config::DbConfig;
use crate::error::{CorruptionError, Error, Result};
use crate::naming::FileNamingStrategy;

/// Chunk files on disk: index to `(version, path)`, newest version first
pub(crate) type ChunkFiles = BTreeMap<i32, Vec<(i32, PathBuf)>>;

pub(crate) fn files_by_index(naming: &dyn FileNamingStrategy) -> Result<ChunkFiles> {
    let mut files = ChunkFiles::new();
    for path in naming.all_present_files()? {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if let Some(id) = naming.parse(name) {
            files.entry(id.index).or_default().push((id.version, path));
        }
    }
    for versions in files.values_mut() {
        versions.sort_by(|a, b| b.0.cmp(&a.0));
    }
    Ok(files)
}

/// How a database is opened
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Verify completed chunk checksums in the background
    pub verify_hash: bool,
    /// Change nothing on disk
    pub read_only: bool,
    /// Create the next chunk when the writer sits on a boundary
    pub create_new_chunks: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            verify_hash: true,
            read_only: false,
            create_new_chunks: true,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            verify_hash: false,
            read_only: true,
            create_new_chunks: false,
        }
    }
}

/// A database directory of chunk and checkpoint files
pub struct TfChunkDb {
    config: DbConfig,
    checkpoints: Checkpoints,
    naming: Arc<dyn FileNamingStrategy>,
    manager: ChunkManager,
    opened: AtomicBool,
    closed: AtomicBool,
    read_only: AtomicBool,
    verification_failed: Arc<AtomicBool>,
    verification: Mutex<Option<JoinHandle<()>>>,
}

impl TfChunkDb {
    pub fn new(config: DbConfig, checkpoints: Checkpoints) -> Result<Self> {
        config.validate()?;
        let naming = config.naming_strategy()?;
        let manager = ChunkManager::new(
            Arc::clone(&naming),
            config.chunk_size,
            config.cached_chunks,
            config.in_memory,
        );
        Ok(Self {
            config,
            checkpoints,
            naming,
            manager,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            verification_failed: Arc::new(AtomicBool::new(false)),
            verification: Mutex::new(None),
        })
    }

    /// Build a database with the checkpoints described by its configuration
    pub fn from_config(config: DbConfig) -> Result<Self> {
        let checkpoints = config.open_checkpoints()?;
        Self::new(config, checkpoints)
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    pub fn naming(&self) -> &Arc<dyn FileNamingStrategy> {
        &self.naming
    }

    pub fn chunk_size(&self) -> i32 {
        self.config.chunk_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Chunk lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChunkEvent> {
        self.manager.subscribe()
    }

    /// Whether background hash verification found a corrupt chunk
    pub fn verification_failed(&self) -> bool {
        self.verification_failed.load(Ordering::SeqCst)
    }

    /// Fails once background verification has found a corrupt chunk
    pub fn ensure_verified(&self) -> Result<()> {
        if self.verification_failed() {
            return Err(CorruptionError::HashValidation(format!(
                "a chunk in {} failed verification",
                self.config.path.display()
            ))
            .into());
        }
        Ok(())
    }

    /// Block until background verification finishes; `true` when every
    /// chunk checked out
    pub fn wait_for_verification(&self) -> bool {
        if let Some(handle) = self.verification.lock().take() {
            if handle.join().is_err() {
                self.verification_failed.store(true, Ordering::SeqCst);
            }
        }
        !self.verification_failed()
    }

    /// Validate the directory and open every chunk
    pub fn open(&self, options: OpenOptions) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidOperation(
                "cannot reopen a closed database".into(),
            ));
        }
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidOperation("database is already open".into()));
        }
        self.read_only.store(options.read_only, Ordering::SeqCst);

        tracing::info!(
            "Opening database at {} (chunk size: {}, read-only: {})",
            self.config.path.display(),
            self.config.chunk_size,
            options.read_only
        );

        self.validate_reader_checkpoints()?;

        if self.checkpoints.truncate.read() >= 0 {
            if options.read_only {
                return Err(Error::InvalidOperation(format!(
                    "truncation to {} is pending; open read-write to apply it",
                    self.checkpoints.truncate.read()
                )));
            }
            truncate::truncate_db(self.naming.as_ref(), self.config.chunk_size, &self.checkpoints)?;
        }

        let files = files_by_index(self.naming.as_ref())?;
        let last_chunk_num = self.open_chunks(&files, options)?;

        self.ensure_no_excessive_chunks(&files, last_chunk_num)?;

        if !options.read_only {
            self.remove_old_chunk_versions(&files, last_chunk_num)?;
            self.clean_up_temp_files();
        }

        if options.verify_hash && last_chunk_num > 0 {
            self.start_verification();
        }

        self.manager.update_cache();
        tracing::info!(
            "Database opened: {} chunk(s), writer at {}",
            self.manager.chunks_count(),
            self.checkpoints.writer.read()
        );
        Ok(())
    }

    fn validate_reader_checkpoints(&self) -> Result<()> {
        let writer = self.checkpoints.writer.read();
        for checkpoint in self.checkpoints.reader_checkpoints() {
            if checkpoint.read() > writer {
                return Err(CorruptionError::ReaderCheckpointHigherThanWriter(
                    checkpoint.name().to_string(),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Open historical chunks and the current one; returns the index of
    /// the last chunk the writer may touch
    fn open_chunks(&self, files: &ChunkFiles, options: OpenOptions) -> Result<i32> {
        let writer = self.checkpoints.writer.read();
        let chunk_size = self.config.chunk_size as i64;
        let mut last_chunk_num = (writer / chunk_size) as i32;
        let newest = |index: i32| files.get(&index).and_then(|v| v.first()).map(|(_, p)| p);
        let last_chunk_missing = newest(last_chunk_num).is_none();

        // Historical chunks: nothing new is written to them
        let mut current: Option<(PathBuf, ChunkFileInfo)> = None;
        let mut index = 0;
        while index < last_chunk_num {
            let path = newest(index)
                .ok_or_else(|| Error::chunk_not_found(self.expected_file_name(index)))?;
            let info = TfChunk::probe(path)?;
            if info.header.chunk_end_number >= last_chunk_num {
                // a merged chunk reaching the writer's chunk
                current = Some((path.clone(), info));
                break;
            }

            let on_boundary = last_chunk_missing
                && (info.header.chunk_start_number as i64 + 1) * chunk_size == writer;
            let chunk = if on_boundary && !info.footer.is_completed {
                // Full but never completed
                let chunk = TfChunk::from_ongoing_file(path, chunk_size)?;
                if !options.read_only {
                    chunk.complete()?;
                }
                chunk
            } else {
                TfChunk::from_completed_file(path, false)?
            };

            index = chunk.header().chunk_end_number + 1;
            self.manager.add_chunk(chunk)?;
        }

        if current.is_none() {
            if let Some(path) = newest(last_chunk_num) {
                current = Some((path.clone(), TfChunk::probe(path)?));
            }
        }

        let Some((path, info)) = current else {
            if writer != last_chunk_num as i64 * chunk_size {
                return Err(Error::chunk_not_found(self.expected_file_name(last_chunk_num)));
            }
            if !options.read_only && options.create_new_chunks {
                self.manager.add_new_chunk()?;
            }
            return Ok(last_chunk_num);
        };

        let local = writer - info.header.chunk_start_position();
        if info.header.is_scavenged || info.footer.is_completed {
            // Scavenged chunks are switched in before the writer checkpoint
            // follows, so the writer can only sit at their start
            if info.header.is_scavenged && local != 0 {
                return Err(Error::bad_chunk(format!(
                    "{}: expected local position 0 but was {} (writer checkpoint {})",
                    path.display(),
                    local,
                    writer
                )));
            }
            if local > info.footer.logical_data_size {
                return Err(Error::bad_chunk(format!(
                    "{}: writer checkpoint {} is past the completed data",
                    path.display(),
                    writer
                )));
            }

            let chunk = TfChunk::from_completed_file(&path, false)?;
            let end_position = chunk.header().chunk_end_position();
            last_chunk_num = chunk.header().chunk_end_number + 1;
            self.manager.add_chunk(chunk)?;

            if !options.read_only {
                tracing::info!(
                    "Moving the writer checkpoint from {} to {}, it points into a completed chunk",
                    writer,
                    end_position
                );
                self.checkpoints.writer.write(end_position);
                self.checkpoints.writer.flush()?;

                // created before the writer checkpoint was flushed
                let next = self.naming.filename_for(last_chunk_num, 0)?;
                if next.exists() {
                    tracing::debug!("Removing excessive chunk {}", next.display());
                    std::fs::remove_file(&next)?;
                }
                if options.create_new_chunks {
                    self.manager.add_new_chunk()?;
                }
            }
        } else {
            let chunk = TfChunk::from_ongoing_file(&path, local)?;
            self.manager.add_chunk(chunk)?;
        }
        Ok(last_chunk_num)
    }

    fn expected_file_name(&self, index: i32) -> String {
        self.naming
            .filename_for(index, 0)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| format!("chunk #{}", index))
    }

    fn ensure_no_excessive_chunks(&self, files: &ChunkFiles, last_chunk_num: i32) -> Result<()> {
        let mut extraneous = Vec::new();
        for (&index, versions) in files.range(last_chunk_num + 1..) {
            for (position, (version, path)) in versions.iter().enumerate() {
                if !path.exists() {
                    continue;
                }
                // A next chunk created before the writer checkpoint moved
                let removable = position == 0
                    && index == last_chunk_num + 1
                    && *version == 0
                    && TfChunk::probe(path)
                        .map(|info| info.header.chunk_start_number == info.header.chunk_end_number)
                        .unwrap_or(false);
                if removable && !self.is_read_only() {
                    tracing::debug!("Removing excessive chunk {}", path.display());
                    std::fs::remove_file(path)?;
                } else if !removable {
                    extraneous.push(path.display().to_string());
                }
            }
        }

        if !extraneous.is_empty() {
            return Err(CorruptionError::ExtraneousFileFound(format!(
                "unexpected files: {}",
                extraneous.join(", ")
            ))
            .into());
        }
        Ok(())
    }

    fn remove_old_chunk_versions(&self, files: &ChunkFiles, last_chunk_num: i32) -> Result<()> {
        for (&index, versions) in files.range(..=last_chunk_num) {
            let Some(chunk) = self.manager.get_chunk(index) else {
                continue;
            };
            for (_, path) in versions {
                if path != chunk.path() && path.exists() {
                    tracing::debug!("Removing old chunk version {}", path.display());
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn clean_up_temp_files(&self) {
        let temp_files = match self.naming.all_temp_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!("Failed to list temporary files: {}", e);
                return;
            }
        };
        for path in temp_files {
            tracing::debug!("Deleting temporary file {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::error!("Failed to delete temporary file {}: {}", path.display(), e);
            }
        }
    }

    /// Verify completed chunks newest to oldest on a background thread
    fn start_verification(&self) {
        let chunks: Vec<Arc<TfChunk>> = self
            .manager
            .all_chunks()
            .into_iter()
            .filter(|c| c.is_completed())
            .rev()
            .collect();
        let failed = Arc::clone(&self.verification_failed);

        let spawned = std::thread::Builder::new()
            .name("chunk-verify".into())
            .spawn(move || {
                for chunk in chunks {
                    let handle = match chunk.acquire_reader() {
                        Ok(handle) => handle,
                        Err(Error::FileBeingDeleted(file)) => {
                            tracing::debug!("Skipping verification of {}, it is being deleted", file);
                            continue;
                        }
                        Err(e) => {
                            tracing::error!("Verification of chunk {} failed: {}", chunk.file_name(), e);
                            failed.store(true, Ordering::SeqCst);
                            return;
                        }
                    };
                    if let Err(e) = handle.chunk().verify_file_hash() {
                        tracing::error!(
                            "Verification of chunk {} failed, the database must not be served: {}",
                            chunk.file_name(),
                            e
                        );
                        failed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                tracing::info!("Background chunk verification finished");
            });

        match spawned {
            Ok(handle) => *self.verification.lock() = Some(handle),
            Err(e) => {
                tracing::error!("Failed to start chunk verification: {}", e);
                self.verification_failed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Close every chunk, then the checkpoints. Checkpoints are only flushed
    /// when every chunk closed cleanly.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let chunks_closed = self.manager.try_close();
        if !chunks_closed {
            tracing::debug!("One or more chunks are still open; skipping checkpoint flush");
        }
        for checkpoint in [
            &self.checkpoints.writer,
            &self.checkpoints.chaser,
            &self.checkpoints.epoch,
            &self.checkpoints.truncate,
            &self.checkpoints.replication,
        ] {
            checkpoint.close(chunks_closed)?;
        }
        tracing::info!("Database at {} closed", self.config.path.display());
        Ok(())
    }
}

impl std::fmt::Debug for TfChunkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfChunkDb")
            .field("path", &self.config.path)
            .field("chunk_size", &self.config.chunk_size)
            .field("manager", &self.manager)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> DbConfig {
        DbConfig::default_for(dir).with_chunk_size(10_000)
    }

    #[test]
    fn test_fresh_directory_gets_first_chunk() {
        let dir = tempdir().unwrap();
        let db = TfChunkDb::from_config(config(dir.path())).unwrap();
        db.open(OpenOptions::default()).unwrap();

        assert_eq!(db.manager().chunks_count(), 1);
        assert!(dir.path().join("chunk-000000.000000").exists());
        assert!(dir.path().join("writer.chk").exists());
        db.close().unwrap();
    }

    #[test]
    fn test_open_twice_rejected() {
        let dir = tempdir().unwrap();
        let db = TfChunkDb::from_config(config(dir.path())).unwrap();
        db.open(OpenOptions::default()).unwrap();
        assert!(matches!(
            db.open(OpenOptions::default()),
            Err(Error::InvalidOperation(_))
        ));
        db.close().unwrap();
        assert!(db.open(OpenOptions::default()).is_err());
    }

    #[test]
    fn test_read_only_creates_nothing() {
        let dir = tempdir().unwrap();
        let db = TfChunkDb::new(config(dir.path()), Checkpoints::in_memory()).unwrap();
        db.open(OpenOptions::read_only()).unwrap();
        assert_eq!(db.manager().chunks_count(), 0);
        assert!(!dir.path().join("chunk-000000.000000").exists());
    }

    #[test]
    fn test_temp_files_cleaned_up() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("bb0f1e0f-5a4e-4c8b-9d5e-1df0c2f6a1c3.tmp");
        std::fs::write(&temp, b"partial").unwrap();

        let db = TfChunkDb::new(config(dir.path()), Checkpoints::in_memory()).unwrap();
        db.open(OpenOptions::default()).unwrap();
        assert!(!temp.exists());
    }
}
