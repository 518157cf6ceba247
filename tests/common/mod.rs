//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;
use wolflog::checkpoint::Checkpoints;
use wolflog::chunk::{AppendResult, TfChunk};
use wolflog::config::DbConfig;
use wolflog::db::TfChunkDb;
use wolflog::reader::TfChunkReader;
use wolflog::record::{LogRecord, PrepareLogRecord};
use wolflog::writer::TfChunkWriter;

pub fn path_for(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

pub fn db_with(dir: &Path, chunk_size: i32, checkpoints: Checkpoints) -> TfChunkDb {
    let config = DbConfig::default_for(dir).with_chunk_size(chunk_size);
    TfChunkDb::new(config, checkpoints).unwrap()
}

/// Checkpoints with the writer at `writer` and every reader at zero
pub fn at(writer: i64) -> Checkpoints {
    Checkpoints::in_memory_at(writer, 0)
}

/// A completed chunk whose data fills the whole chunk
pub fn create_single_chunk(dir: &Path, chunk_size: i32, number: i32, name: &str) -> PathBuf {
    create_completed_chunk(dir, chunk_size, number, name, chunk_size as usize)
}

/// A completed chunk holding `data_size` bytes of data
pub fn create_completed_chunk(
    dir: &Path,
    chunk_size: i32,
    number: i32,
    name: &str,
    data_size: usize,
) -> PathBuf {
    let path = path_for(dir, name);
    let chunk = TfChunk::create_new(&path, chunk_size, number, number, false).unwrap();
    if data_size > 0 {
        let appended = chunk.append_raw(&vec![0u8; data_size]).unwrap();
        assert!(matches!(appended, AppendResult::Appended { .. }));
    }
    chunk.complete().unwrap();
    path
}

/// An empty, completed scavenged chunk covering `start..=end`
pub fn create_scavenged_chunk(dir: &Path, chunk_size: i32, start: i32, end: i32, name: &str) -> PathBuf {
    let path = path_for(dir, name);
    let chunk = TfChunk::create_new(&path, chunk_size, start, end, true).unwrap();
    chunk.complete_scavenge(Vec::new()).unwrap();
    path
}

/// A fresh ongoing chunk
pub fn create_ongoing_chunk(dir: &Path, chunk_size: i32, number: i32, name: &str) -> PathBuf {
    let path = path_for(dir, name);
    TfChunk::create_new(&path, chunk_size, number, number, false).unwrap();
    path
}

/// Names of every file in `dir`, sorted
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn prepare_at(position: i64, stream: &str, payload: usize) -> LogRecord {
    LogRecord::Prepare(PrepareLogRecord::single_write(
        position,
        Uuid::new_v4(),
        Uuid::new_v4(),
        stream,
        -2,
        "TestEvent",
        vec![0xAB; payload],
        Vec::new(),
    ))
}

/// Write prepares of `payload` bytes until the database holds `chunks`
/// chunks; returns the positions they landed at
pub fn write_until_chunks(db: &Arc<TfChunkDb>, chunks: i32, payload: usize) -> Vec<i64> {
    let mut writer = TfChunkWriter::open(Arc::clone(db)).unwrap();
    let mut positions = Vec::new();
    while db.manager().chunks_count() < chunks {
        let record = prepare_at(writer.position(), "stream-1", payload);
        let written = writer.write(&record).unwrap();
        assert!(written.written);
        positions.push(written.log_position);
    }
    writer.flush().unwrap();
    writer.close().unwrap();
    positions
}

/// Positions of every record visible from `from`
pub fn positions_from(db: &Arc<TfChunkDb>, from: i64) -> Vec<i64> {
    let mut reader =
        TfChunkReader::new(Arc::clone(db), Arc::clone(&db.checkpoints().writer), from).unwrap();
    let mut positions = Vec::new();
    while let Some(read) = reader.try_read_next().unwrap() {
        positions.push(read.position);
    }
    positions
}
