//! Pending truncation
//!
//! Applied before validation when the truncate checkpoint holds a
//! position. Everything at or after that position is removed from disk
//! and the checkpoints are rewound.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checkpoint::{Checkpoints, NO_TRUNCATION};
use crate::chunk::{AppendResult, ChunkHeader, TfChunk};
use crate::error::{CorruptionError, Error, Result};
use crate::naming::FileNamingStrategy;

use super::{files_by_index, ChunkFiles};

const ZERO_BLOCK_SIZE: usize = 64 * 1024;
const COPY_BLOCK_SIZE: usize = 64 * 1024;

/// Newest file of a chunk as laid out on disk
#[derive(Debug)]
struct ChunkLayout {
    path: PathBuf,
    header: ChunkHeader,
    completed: bool,
}

/// Walk the newest versions from chunk 0 to find the chunk holding `chunk_number`
fn find_containing(
    files: &ChunkFiles,
    chunk_number: i32,
) -> Result<Option<ChunkLayout>> {
    let mut index = 0;
    while index <= chunk_number {
        let Some((_, path)) = files.get(&index).and_then(|v| v.first()) else {
            return Ok(None);
        };
        let info = TfChunk::probe(path)?;
        let header = info.header;
        if header.chunk_end_number >= chunk_number {
            return Ok(Some(ChunkLayout {
                path: path.clone(),
                header,
                completed: info.footer.is_completed,
            }));
        }
        index = header.chunk_end_number + 1;
    }
    Ok(None)
}

fn remove_file(path: &Path, reason: &str) -> Result<()> {
    tracing::debug!("{}: {}", reason, path.display());
    std::fs::remove_file(path)?;
    Ok(())
}

/// Overwrite `[from, to)` of the data area with zeroes
fn zero_tail(path: &Path, from: i64, to: i64) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(ChunkHeader::SIZE as u64 + from as u64))?;
    let zeroes = vec![0u8; ZERO_BLOCK_SIZE];
    let mut remaining = (to - from).max(0) as usize;
    while remaining > 0 {
        let len = remaining.min(ZERO_BLOCK_SIZE);
        file.write_all(&zeroes[..len])?;
        remaining -= len;
    }
    file.sync_all()?;
    Ok(())
}

/// Copy the first `keep` data bytes of a completed chunk into a fresh
/// ongoing chunk that takes its place
fn reopen_as_ongoing(
    naming: &dyn FileNamingStrategy,
    layout: &ChunkLayout,
    keep: i64,
) -> Result<PathBuf> {
    let header = &layout.header;
    let source = TfChunk::from_completed_file(&layout.path, false)?;
    let temp = naming.temp_filename();
    let target = TfChunk::create_new(
        &temp,
        header.chunk_size,
        header.chunk_start_number,
        header.chunk_end_number,
        false,
    )?;

    let mut buf = vec![0u8; COPY_BLOCK_SIZE];
    let mut offset = 0i64;
    while offset < keep {
        let want = ((keep - offset) as usize).min(COPY_BLOCK_SIZE);
        let read = source.read_data(offset, &mut buf[..want])?;
        if read == 0 {
            break;
        }
        if target.append_raw(&buf[..read])? == AppendResult::NotEnoughSpace {
            return Err(Error::Internal(format!(
                "truncation copy of {} overflowed the new chunk",
                source.file_name()
            )));
        }
        offset += read as i64;
    }
    target.flush()?;
    target.dispose();
    source.dispose();

    let version = naming
        .version_for(&layout.path)
        .map_or(0, |v| v + 1);
    let new_path = naming.filename_for(header.chunk_start_number, version)?;
    std::fs::rename(&temp, &new_path)?;
    // Without versions in the name the rename already replaced the old file
    if new_path != layout.path {
        remove_file(&layout.path, "Removing truncated chunk")?;
    }
    Ok(new_path)
}

/// Apply the truncation recorded in the truncate checkpoint, if any
pub(crate) fn truncate_db(
    naming: &dyn FileNamingStrategy,
    chunk_size: i32,
    checkpoints: &Checkpoints,
) -> Result<()> {
    let requested = checkpoints.truncate.read();
    if requested < 0 {
        return Ok(());
    }
    let writer = checkpoints.writer.read();
    if requested > writer {
        return Err(CorruptionError::ReaderCheckpointHigherThanWriter(
            checkpoints.truncate.name().to_string(),
        )
        .into());
    }

    tracing::info!(
        "Truncating database from {} to {} (chunk size {})",
        writer,
        requested,
        chunk_size
    );

    let files = files_by_index(naming)?;
    let chunk_number = (requested / chunk_size as i64) as i32;
    let mut truncate_at = requested;

    // Chunk indexes from this one on lose all their files
    let first_deleted = match find_containing(&files, chunk_number)? {
        None => chunk_number,
        Some(layout) if layout.header.is_scavenged => {
            truncate_at = layout.header.chunk_start_position();
            tracing::info!(
                "Truncation point is inside scavenged chunk {}, moving it back to {}",
                layout.path.display(),
                truncate_at
            );
            layout.header.chunk_start_number
        }
        Some(layout) => {
            let local = requested - layout.header.chunk_start_position();
            if layout.completed {
                let info = TfChunk::probe(&layout.path)?;
                let keep = local.min(info.footer.physical_data_size as i64);
                truncate_at = layout.header.chunk_start_position() + keep;
                let new_path = reopen_as_ongoing(naming, &layout, keep)?;
                tracing::info!(
                    "Rewrote completed chunk {} as ongoing {} with {} bytes",
                    layout.path.display(),
                    new_path.display(),
                    keep
                );
            } else {
                zero_tail(&layout.path, local, layout.header.chunk_size as i64)?;
            }
            layout.header.chunk_end_number + 1
        }
    };

    for (index, versions) in files.range(first_deleted..) {
        for (_, path) in versions {
            if path.exists() {
                remove_file(path, &format!("Removing chunk #{} beyond truncation point", index))?;
            }
        }
    }

    for checkpoint in [
        &checkpoints.writer,
        &checkpoints.chaser,
        &checkpoints.epoch,
        &checkpoints.replication,
    ] {
        if checkpoint.read() > truncate_at {
            tracing::info!(
                "Moving {} checkpoint from {} to {}",
                checkpoint.name(),
                checkpoint.read(),
                truncate_at
            );
            checkpoint.write(truncate_at);
            checkpoint.flush()?;
        }
    }

    // Only once everything else is durable
    checkpoints.truncate.write(NO_TRUNCATION);
    checkpoints.truncate.flush()?;
    Ok(())
}
