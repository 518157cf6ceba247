//! Scavenge merge
//!
//! Rewrites a run of completed chunks into one scavenged chunk holding only
//! the records a caller-supplied predicate keeps. Kept records stay at
//! their original log positions; the position map of the new chunk
//! translates them to their new offsets. What to keep is not decided here.

use std::path::Path;
use std::sync::Arc;

use crate::chunk::{AppendResult, ChunkReadHandle, PosMapEntry, TfChunk};
use crate::db::TfChunkDb;
use crate::error::{Error, Result};
use crate::record::LogRecord;

/// Outcome of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScavengeResult {
    /// Bytes on disk of the replaced chunk files
    pub old_size: u64,
    /// Bytes on disk of the merged chunk file
    pub new_size: u64,
    pub kept: usize,
    pub dropped: usize,
}

impl ScavengeResult {
    pub fn space_saved(&self) -> i64 {
        self.old_size as i64 - self.new_size as i64
    }
}

pub struct ChunkMerger;

impl ChunkMerger {
    /// Merge `chunks` (consecutive and completed) into one scavenged chunk
    /// and switch it into the database
    pub fn merge<F>(db: &TfChunkDb, chunks: &[Arc<TfChunk>], mut retain: F) -> Result<ScavengeResult>
    where
        F: FnMut(&LogRecord) -> bool,
    {
        let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
            return Err(Error::InvalidArgument("nothing to merge".into()));
        };
        check_run(chunks)?;
        let start = first.header().chunk_start_number;
        let end = last.header().chunk_end_number;

        // Pin the sources so a concurrent switch cannot delete them under us
        let handles = chunks
            .iter()
            .map(|c| c.acquire_reader())
            .collect::<Result<Vec<ChunkReadHandle>>>()?;

        tracing::info!(
            "Scavenging chunks #{}-{} into a merged chunk",
            start,
            end
        );

        let temp = db.naming().temp_filename();
        let merged = TfChunk::create_new(&temp, db.chunk_size(), start, end, true)?;
        let base = merged.header().chunk_start_position();

        let mut result = ScavengeResult {
            old_size: 0,
            new_size: 0,
            kept: 0,
            dropped: 0,
        };
        let copied = copy_records(&handles, &merged, base, &mut retain, &mut result)
            .and_then(|map| merged.complete_scavenge(map));
        if let Err(e) = copied {
            merged.dispose();
            discard(&temp);
            return Err(e);
        }
        drop(handles);

        result.new_size = std::fs::metadata(&temp)?.len();
        let installed = db.manager().switch_chunk(merged, db.config().verify_hash);
        let installed = match installed {
            Ok(chunk) => chunk,
            Err(e) => {
                discard(&temp);
                return Err(e);
            }
        };

        tracing::info!(
            "Scavenged chunks #{}-{} into {}: kept {}, dropped {}, {} -> {} bytes",
            start,
            end,
            installed.file_name(),
            result.kept,
            result.dropped,
            result.old_size,
            result.new_size
        );
        Ok(result)
    }
}

fn check_run(chunks: &[Arc<TfChunk>]) -> Result<()> {
    for chunk in chunks {
        if !chunk.is_completed() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} is not completed and cannot be scavenged",
                chunk.file_name()
            )));
        }
    }
    for pair in chunks.windows(2) {
        let (a, b) = (pair[0].header(), pair[1].header());
        if b.chunk_start_number != a.chunk_end_number + 1 {
            return Err(Error::InvalidArgument(format!(
                "chunks #{}-{} and #{}-{} are not consecutive",
                a.chunk_start_number, a.chunk_end_number, b.chunk_start_number, b.chunk_end_number
            )));
        }
    }
    Ok(())
}

fn copy_records<F>(
    handles: &[ChunkReadHandle],
    merged: &TfChunk,
    base: i64,
    retain: &mut F,
    result: &mut ScavengeResult,
) -> Result<Vec<PosMapEntry>>
where
    F: FnMut(&LogRecord) -> bool,
{
    let mut map = Vec::new();
    for handle in handles {
        let chunk = handle.chunk();
        result.old_size += std::fs::metadata(chunk.path())?.len();

        let mut read = handle.try_read_first()?;
        while let Some(record) = read.record {
            if retain(&record) {
                match merged.try_append(&record)? {
                    AppendResult::Appended { old_position, .. } => {
                        map.push(PosMapEntry::new(
                            record.log_position() - base,
                            old_position as i32,
                        ));
                        result.kept += 1;
                    }
                    AppendResult::NotEnoughSpace => {
                        return Err(Error::InvalidOperation(format!(
                            "kept records of chunk {} do not fit the merged chunk",
                            chunk.file_name()
                        )));
                    }
                }
            } else {
                result.dropped += 1;
            }
            read = handle.try_read_closest_forward(read.next_position)?;
        }
    }
    Ok(map)
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed scavenge output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove scavenge output {}: {}", path.display(), e),
    }
}
