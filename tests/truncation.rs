//! Pending truncation applied on open

mod common;

use std::sync::Arc;

use common::*;
use tempfile::tempdir;
use wolflog::checkpoint::{Checkpoints, NO_TRUNCATION};
use wolflog::db::{OpenOptions, TfChunkDb};
use wolflog::error::{CorruptionError, Error};
use wolflog::scavenge::ChunkMerger;
use wolflog::writer::TfChunkWriter;

const CHUNK_SIZE: i32 = 1000;

fn open_db(dir: &std::path::Path, checkpoints: Checkpoints) -> Arc<TfChunkDb> {
    let db = db_with(dir, CHUNK_SIZE, checkpoints);
    db.open(OpenOptions {
        verify_hash: false,
        ..OpenOptions::default()
    })
    .unwrap();
    Arc::new(db)
}

/// Fill a database up to `chunks` chunks and close it, keeping its checkpoints
fn filled(dir: &std::path::Path, chunks: i32) -> (Checkpoints, Vec<i64>) {
    let checkpoints = Checkpoints::in_memory();
    let db = open_db(dir, checkpoints.clone());
    let positions = write_until_chunks(&db, chunks, 50);
    db.close().unwrap();
    (checkpoints, positions)
}

fn request_truncation(checkpoints: &Checkpoints, position: i64) {
    checkpoints.truncate.write(position);
    checkpoints.truncate.flush().unwrap();
}

#[test]
fn truncating_into_completed_chunk_rewrites_it() {
    let dir = tempdir().unwrap();
    let (checkpoints, positions) = filled(dir.path(), 3);
    let target = *positions
        .iter()
        .filter(|&&p| p > 1000 && p < 2000)
        .nth(1)
        .unwrap();

    checkpoints.chaser.write(checkpoints.writer.read());
    checkpoints.chaser.flush().unwrap();
    request_truncation(&checkpoints, target);

    let db = open_db(dir.path(), checkpoints.clone());
    assert_eq!(checkpoints.writer.read(), target);
    assert_eq!(checkpoints.chaser.read(), target);
    assert_eq!(checkpoints.truncate.read(), NO_TRUNCATION);
    assert_eq!(
        files_in(dir.path()),
        vec!["chunk-000000.000000", "chunk-000001.000001"]
    );

    let chunk = db.manager().get_chunk(1).unwrap();
    assert!(!chunk.is_completed());
    assert_eq!(chunk.physical_data_size(), target - 1000);

    let expected: Vec<i64> = positions.iter().copied().filter(|&p| p < target).collect();
    assert_eq!(positions_from(&db, 0), expected);

    let mut writer = TfChunkWriter::open(Arc::clone(&db)).unwrap();
    assert_eq!(writer.position(), target);
    let written = writer.write(&prepare_at(target, "stream-2", 10)).unwrap();
    assert!(written.written);
    writer.flush().unwrap();
    assert_eq!(positions_from(&db, target), vec![target]);
}

#[test]
fn truncating_inside_ongoing_chunk_zeroes_the_tail() {
    let dir = tempdir().unwrap();
    let checkpoints = Checkpoints::in_memory();
    let db = open_db(dir.path(), checkpoints.clone());
    let mut positions = write_until_chunks(&db, 3, 50);
    let mut writer = TfChunkWriter::open(Arc::clone(&db)).unwrap();
    for _ in 0..3 {
        let written = writer
            .write(&prepare_at(writer.position(), "stream-1", 50))
            .unwrap();
        positions.push(written.log_position);
    }
    writer.close().unwrap();
    drop(writer);
    db.close().unwrap();

    let target = *positions
        .iter()
        .filter(|&&p| p > 2000 && p < 3000)
        .nth(1)
        .unwrap();
    request_truncation(&checkpoints, target);

    let db = open_db(dir.path(), checkpoints.clone());
    assert_eq!(checkpoints.writer.read(), target);
    assert_eq!(
        files_in(dir.path()),
        vec![
            "chunk-000000.000000",
            "chunk-000001.000000",
            "chunk-000002.000000"
        ]
    );

    let bytes = std::fs::read(path_for(dir.path(), "chunk-000002.000000")).unwrap();
    let local = (target - 2000) as usize;
    assert!(bytes[128 + local..128 + CHUNK_SIZE as usize]
        .iter()
        .all(|&b| b == 0));

    let expected: Vec<i64> = positions.iter().copied().filter(|&p| p < target).collect();
    assert_eq!(positions_from(&db, 0), expected);
}

#[test]
fn truncating_on_chunk_boundary_keeps_an_empty_chunk() {
    let dir = tempdir().unwrap();
    let (checkpoints, _) = filled(dir.path(), 4);
    request_truncation(&checkpoints, 2000);

    let db = open_db(dir.path(), checkpoints.clone());
    assert_eq!(checkpoints.writer.read(), 2000);
    let chunk = db.manager().get_chunk(2).unwrap();
    assert!(!chunk.is_completed());
    assert_eq!(chunk.physical_data_size(), 0);
    assert!(db.manager().get_chunk(3).is_none());
}

#[test]
fn truncating_into_scavenged_chunk_drops_the_whole_chunk() {
    let dir = tempdir().unwrap();
    let checkpoints = Checkpoints::in_memory();
    let db = open_db(dir.path(), checkpoints.clone());
    write_until_chunks(&db, 3, 50);
    let sources = vec![
        db.manager().get_chunk(0).unwrap(),
        db.manager().get_chunk(1).unwrap(),
    ];
    ChunkMerger::merge(&db, &sources, |_| true).unwrap();
    drop(sources);
    db.close().unwrap();

    request_truncation(&checkpoints, 1500);
    let db = open_db(dir.path(), checkpoints.clone());
    assert_eq!(checkpoints.writer.read(), 0);
    assert_eq!(files_in(dir.path()), vec!["chunk-000000.000000"]);
    assert!(positions_from(&db, 0).is_empty());
}

#[test]
fn truncation_past_writer_is_corruption() {
    let dir = tempdir().unwrap();
    let (checkpoints, _) = filled(dir.path(), 2);
    request_truncation(&checkpoints, checkpoints.writer.read() + 1);

    let db = db_with(dir.path(), CHUNK_SIZE, checkpoints);
    let err = db.open(OpenOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::CorruptDatabase(CorruptionError::ReaderCheckpointHigherThanWriter(_))
    ));
}
