//! Scavenged chunks surviving a restart

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use wolflog::config::DbConfig;
use wolflog::db::{OpenOptions, TfChunkDb};
use wolflog::reader::TfChunkReader;
use wolflog::scavenge::ChunkMerger;
use wolflog::writer::TfChunkWriter;

fn open_from_files(dir: &std::path::Path) -> Arc<TfChunkDb> {
    let config = DbConfig::default_for(dir).with_chunk_size(1000);
    let db = TfChunkDb::from_config(config).unwrap();
    db.open(OpenOptions::default()).unwrap();
    Arc::new(db)
}

#[test]
fn merged_chunk_is_selected_after_reopen() {
    let dir = tempdir().unwrap();
    let (written, kept) = {
        let db = open_from_files(dir.path());
        let written = write_until_chunks(&db, 4, 40);

        let mut rng = StdRng::seed_from_u64(7);
        let mut kept = HashSet::new();
        let sources: Vec<_> = (0..3).map(|i| db.manager().get_chunk(i).unwrap()).collect();
        let result = ChunkMerger::merge(&db, &sources, |record| {
            let keep = rng.gen_bool(0.5);
            if keep {
                kept.insert(record.log_position());
            }
            keep
        })
        .unwrap();
        assert_eq!(result.kept, kept.len());
        drop(sources);
        db.close().unwrap();
        (written, kept)
    };

    assert_eq!(
        files_in(dir.path())
            .into_iter()
            .filter(|name| name.starts_with("chunk-"))
            .collect::<Vec<_>>(),
        vec!["chunk-000000.000001", "chunk-000003.000000"]
    );

    let db = open_from_files(dir.path());
    assert!(db.wait_for_verification());
    let merged = db.manager().get_chunk(2).unwrap();
    assert!(merged.header().is_scavenged);
    assert_eq!(merged.header().chunk_start_number, 0);
    assert_eq!(merged.header().chunk_end_number, 2);

    let expected: Vec<i64> = written
        .iter()
        .copied()
        .filter(|p| *p >= 3000 || kept.contains(p))
        .collect();
    assert_eq!(positions_from(&db, 0), expected);
}

#[test]
fn writer_continues_after_merge_and_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open_from_files(dir.path());
        write_until_chunks(&db, 3, 40);
        let sources = vec![
            db.manager().get_chunk(0).unwrap(),
            db.manager().get_chunk(1).unwrap(),
        ];
        ChunkMerger::merge(&db, &sources, |_| true).unwrap();
        drop(sources);
        db.close().unwrap();
    }

    let db = open_from_files(dir.path());
    let mut writer = TfChunkWriter::open(Arc::clone(&db)).unwrap();
    let position = writer.position();
    assert!(position > 2000);
    writer
        .write(&prepare_at(position, "after-merge", 10))
        .unwrap();
    writer.flush().unwrap();

    let reader =
        TfChunkReader::new(Arc::clone(&db), Arc::clone(&db.checkpoints().writer), 0).unwrap();
    let read = reader.try_read_at(position).unwrap().unwrap();
    assert_eq!(read.position, position);

    // backwards through the merged chunk
    let mut reader =
        TfChunkReader::new(Arc::clone(&db), Arc::clone(&db.checkpoints().writer), 2000).unwrap();
    let mut backwards = Vec::new();
    while let Some(read) = reader.try_read_prev().unwrap() {
        backwards.push(read.position);
    }
    backwards.reverse();
    let forwards: Vec<i64> = positions_from(&db, 0)
        .into_iter()
        .filter(|p| *p < 2000)
        .collect();
    assert_eq!(backwards, forwards);
}
