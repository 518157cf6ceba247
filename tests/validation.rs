//! Startup validation of database directories

mod common;

use std::sync::Arc;

use common::*;
use tempfile::tempdir;
use wolflog::chaser::TfChunkChaser;
use wolflog::checkpoint::Checkpoints;
use wolflog::db::OpenOptions;
use wolflog::error::{CorruptionError, Error};
use wolflog::naming::FileNamingStrategy;
use wolflog::writer::TfChunkWriter;

fn no_verify() -> OpenOptions {
    OpenOptions {
        verify_hash: false,
        ..OpenOptions::default()
    }
}

fn corruption(result: wolflog::Result<()>) -> CorruptionError {
    match result {
        Err(Error::CorruptDatabase(inner)) => inner,
        other => panic!("expected a corrupt database, got {:?}", other),
    }
}

#[test]
fn file_of_wrong_size_is_a_bad_chunk() {
    let dir = tempdir().unwrap();
    std::fs::write(
        path_for(dir.path(), "chunk-000000.000000"),
        "this is just some test blahbydy blah",
    )
    .unwrap();
    let db = db_with(dir.path(), 10_000, at(500));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn not_enough_files_to_reach_writer() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    let db = db_with(dir.path(), 10_000, at(15_000));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ChunkNotFound(_)
    ));
}

#[test]
fn exactly_enough_files_to_reach_writer() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    let db = db_with(dir.path(), 10_000, at(10_000));
    db.open(no_verify()).unwrap();
    assert!(db.manager().get_chunk(1).is_some());
}

#[test]
fn ongoing_chunks_before_the_last_are_bad() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 1000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 1000, 1, "chunk-000001.000000");
    create_ongoing_chunk(dir.path(), 1000, 2, "chunk-000002.000000");
    create_ongoing_chunk(dir.path(), 1000, 3, "chunk-000003.000000");
    let db = db_with(dir.path(), 1000, at(3500));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn next_ongoing_chunk_on_boundary_is_used() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    let db = db_with(dir.path(), 10_000, at(10_000));
    db.open(no_verify()).unwrap();
    assert!(!db.manager().get_chunk(1).unwrap().is_completed());
}

#[test]
fn next_completed_chunk_on_boundary_is_accepted() {
    // Truncation can leave this layout behind
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    let db = db_with(dir.path(), 10_000, at(10_000));
    db.open(no_verify()).unwrap();
    assert_eq!(db.checkpoints().writer.read(), 20_000);
    assert!(path_for(dir.path(), "chunk-000002.000000").exists());
}

#[test]
fn full_but_uncompleted_last_chunk_gets_completed() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    let db = db_with(dir.path(), 10_000, at(10_000));
    db.open(no_verify()).unwrap();
    assert!(db.manager().get_chunk(0).unwrap().is_completed());
    assert!(db.manager().get_chunk(1).is_some());
}

#[test]
fn uncompleted_chunk_followed_by_another_is_bad() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    let db = db_with(dir.path(), 10_000, at(10_000));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn single_sequential_next_chunk_is_removed() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    let db = db_with(dir.path(), 10_000, at(9000));
    db.open(no_verify()).unwrap();
    assert_eq!(files_in(dir.path()), vec!["chunk-000000.000000"]);
}

#[test]
fn sequential_next_chunk_with_non_zero_version_is_extraneous() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 10_000, 1, "chunk-000001.000001");
    let db = db_with(dir.path(), 10_000, at(9000));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ExtraneousFileFound(_)
    ));
}

#[test]
fn non_sequential_chunk_is_extraneous() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 10_000, 2, "chunk-000002.000000");
    let db = db_with(dir.path(), 10_000, at(9000));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ExtraneousFileFound(_)
    ));
}

#[test]
fn multiple_extraneous_files_name_the_unexpected_one() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    create_single_chunk(dir.path(), 10_000, 2, "chunk-000002.000000");
    create_single_chunk(dir.path(), 10_000, 3, "chunk-000003.000000");
    let db = db_with(dir.path(), 10_000, at(15_000));
    match corruption(db.open(no_verify())) {
        CorruptionError::ExtraneousFileFound(msg) => {
            assert!(msg.contains("chunk-000003.000000"));
            assert!(!msg.contains("chunk-000002.000000"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn old_version_beyond_writer_is_extraneous() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 10_000, 1, "chunk-000001.000000");
    create_single_chunk(dir.path(), 10_000, 2, "chunk-000002.000000");
    create_single_chunk(dir.path(), 10_000, 2, "chunk-000002.000001");
    let db = db_with(dir.path(), 10_000, at(15_000));
    match corruption(db.open(no_verify())) {
        CorruptionError::ExtraneousFileFound(msg) => assert!(msg.contains("chunk-000002.000000")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn missing_middle_chunk_is_not_found() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 10_000, 2, "chunk-000002.000000");
    let db = db_with(dir.path(), 10_000, at(25_000));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ChunkNotFound(_)
    ));
}

#[test]
fn extraneous_file_in_brand_new_database() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 10_000, 4, "chunk-000004.000000");
    let db = db_with(dir.path(), 10_000, at(0));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ExtraneousFileFound(_)
    ));
}

#[test]
fn chaser_ahead_of_writer() {
    let dir = tempdir().unwrap();
    let db = db_with(dir.path(), 10_000, Checkpoints::in_memory_at(0, 11));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ReaderCheckpointHigherThanWriter(_)
    ));
}

#[test]
fn epoch_ahead_of_writer() {
    let dir = tempdir().unwrap();
    let checkpoints = Checkpoints::in_memory();
    checkpoints.epoch.write(11);
    checkpoints.epoch.flush().unwrap();
    let db = db_with(dir.path(), 10_000, checkpoints);
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ReaderCheckpointHigherThanWriter(_)
    ));
}

#[test]
fn no_files_and_zero_checkpoint_creates_first_chunk() {
    let dir = tempdir().unwrap();
    let db = db_with(dir.path(), 10_000, at(0));
    db.open(no_verify()).unwrap();
    assert!(path_for(dir.path(), "chunk-000000.000000").exists());
}

#[test]
fn first_ongoing_chunk_with_zero_checkpoint() {
    let dir = tempdir().unwrap();
    create_ongoing_chunk(dir.path(), 10_000, 0, "chunk-000000.000000");
    let db = db_with(dir.path(), 10_000, at(0));
    db.open(no_verify()).unwrap();
    assert_eq!(files_in(dir.path()), vec!["chunk-000000.000000"]);
}

#[test]
fn writer_inside_completed_chunk_moves_to_its_end() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 1000, 0, "chunk-000000.000000");
    create_completed_chunk(dir.path(), 1000, 1, "chunk-000001.000001", 500);
    let db = db_with(dir.path(), 1000, at(1500));
    db.open(no_verify()).unwrap();

    assert_eq!(db.checkpoints().writer.read(), 2000);
    assert_eq!(
        files_in(dir.path()),
        vec![
            "chunk-000000.000000",
            "chunk-000001.000001",
            "chunk-000002.000000"
        ]
    );
}

#[test]
fn writer_past_completed_data_is_bad() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 1000, 0, "chunk-000000.000000");
    create_completed_chunk(dir.path(), 1000, 1, "chunk-000001.000001", 499);
    let db = db_with(dir.path(), 1000, at(1500));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn writer_inside_scavenged_chunk_is_bad() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 1000, 0, "chunk-000000.000000");
    create_scavenged_chunk(dir.path(), 1000, 1, 1, "chunk-000001.000001");
    let db = db_with(dir.path(), 1000, at(1500));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn merged_chunk_reaching_the_writer_chunk() {
    let dir = tempdir().unwrap();
    create_scavenged_chunk(dir.path(), 100, 0, 2, "chunk-000000.000001");
    let db = db_with(dir.path(), 100, at(300));
    db.open(no_verify()).unwrap();

    let merged = db.manager().get_chunk(0).unwrap();
    assert!(std::sync::Arc::ptr_eq(&merged, &db.manager().get_chunk(2).unwrap()));
    assert!(!db.manager().get_chunk(3).unwrap().is_completed());
}

#[test]
fn old_versions_are_removed() {
    let dir = tempdir().unwrap();
    std::fs::File::create(path_for(dir.path(), "foo")).unwrap();
    std::fs::File::create(path_for(dir.path(), "bla")).unwrap();

    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000002");
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000005");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000000");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000001");
    create_single_chunk(dir.path(), 100, 2, "chunk-000002.000000");
    create_single_chunk(dir.path(), 100, 3, "chunk-000003.000007");
    create_ongoing_chunk(dir.path(), 100, 3, "chunk-000003.000008");

    let db = db_with(dir.path(), 100, at(350));
    db.open(no_verify()).unwrap();

    assert_eq!(
        files_in(dir.path()),
        vec![
            "bla",
            "chunk-000000.000005",
            "chunk-000001.000001",
            "chunk-000002.000000",
            "chunk-000003.000008",
            "foo"
        ]
    );
}

#[test]
fn only_newest_version_survives() {
    let dir = tempdir().unwrap();
    for index in 0..5 {
        create_single_chunk(dir.path(), 100, index, &format!("chunk-{:06}.000000", index));
    }
    create_single_chunk(dir.path(), 100, 5, "chunk-000005.000000");
    create_single_chunk(dir.path(), 100, 5, "chunk-000005.000002");
    create_single_chunk(dir.path(), 100, 5, "chunk-000005.000007");

    let db = db_with(dir.path(), 100, at(600));
    let versions = db.naming().all_versions_for(5).unwrap();
    let names: Vec<_> = versions
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["chunk-000005.000007", "chunk-000005.000002", "chunk-000005.000000"]
    );

    db.open(no_verify()).unwrap();
    assert_eq!(
        db.naming().all_versions_for(5).unwrap(),
        vec![path_for(dir.path(), "chunk-000005.000007")]
    );
}

#[test]
fn boundary_keeps_existing_ongoing_chunk() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000001");
    create_ongoing_chunk(dir.path(), 100, 2, "chunk-000002.000005");

    let db = db_with(dir.path(), 100, at(200));
    db.open(no_verify()).unwrap();
    assert_eq!(
        files_in(dir.path()),
        vec![
            "chunk-000000.000000",
            "chunk-000001.000001",
            "chunk-000002.000005"
        ]
    );
}

#[test]
fn boundary_removes_excessive_versions() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000001");
    create_single_chunk(dir.path(), 100, 2, "chunk-000002.000000");
    create_ongoing_chunk(dir.path(), 100, 2, "chunk-000002.000001");

    let db = db_with(dir.path(), 100, at(200));
    db.open(no_verify()).unwrap();
    assert_eq!(
        files_in(dir.path()),
        vec![
            "chunk-000000.000000",
            "chunk-000001.000001",
            "chunk-000002.000001"
        ]
    );
}

#[test]
fn boundary_creates_missing_next_chunk() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000001");

    let db = db_with(dir.path(), 100, at(200));
    db.open(no_verify()).unwrap();
    assert!(db.manager().get_chunk(2).is_some());
    assert_eq!(
        files_in(dir.path()),
        vec![
            "chunk-000000.000000",
            "chunk-000001.000001",
            "chunk-000002.000000"
        ]
    );
}

#[test]
fn one_past_boundary_without_chunk_is_not_found() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 1, "chunk-000001.000000");

    let db = db_with(dir.path(), 100, at(201));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::ChunkNotFound(_)
    ));
}

#[test]
fn boundary_accepts_truncated_completed_chunk() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_completed_chunk(dir.path(), 100, 1, "chunk-000001.000001", 90);

    let db = db_with(dir.path(), 100, at(200));
    db.open(no_verify()).unwrap();
    assert!(db.manager().get_chunk(2).is_some());
    assert_eq!(files_in(dir.path()).len(), 3);
}

#[test]
fn boundary_rejects_short_uncompleted_chunk() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    let short = path_for(dir.path(), "chunk-000001.000001");
    create_ongoing_chunk(dir.path(), 100, 1, "chunk-000001.000001");
    let file = std::fs::OpenOptions::new().write(true).open(&short).unwrap();
    file.set_len(128 + 90 + 128).unwrap();

    let db = db_with(dir.path(), 100, at(200));
    assert!(matches!(
        corruption(db.open(no_verify())),
        CorruptionError::BadChunkInDatabase(_)
    ));
}

#[test]
fn temporary_files_are_removed() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_ongoing_chunk(dir.path(), 100, 1, "chunk-000001.000001");
    for name in ["bla", "bla.scavenge.tmp", "bla.tmp"] {
        std::fs::File::create(path_for(dir.path(), name)).unwrap();
    }

    let db = db_with(dir.path(), 100, at(150));
    db.open(no_verify()).unwrap();
    assert_eq!(
        files_in(dir.path()),
        vec!["bla", "chunk-000000.000000", "chunk-000001.000001"]
    );
}

#[test]
fn validation_is_idempotent() {
    let dir = tempdir().unwrap();
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000000");
    create_single_chunk(dir.path(), 100, 0, "chunk-000000.000001");
    create_ongoing_chunk(dir.path(), 100, 1, "chunk-000001.000000");

    let first = db_with(dir.path(), 100, at(150));
    first.open(no_verify()).unwrap();
    first.close().unwrap();
    let after_first = files_in(dir.path());

    let second = db_with(dir.path(), 100, at(150));
    second.open(no_verify()).unwrap();
    second.close().unwrap();
    assert_eq!(files_in(dir.path()), after_first);
    assert_eq!(after_first, vec!["chunk-000000.000001", "chunk-000001.000000"]);
}

#[test]
fn background_verification_flags_corruption() {
    let dir = tempdir().unwrap();
    let first = create_completed_chunk(dir.path(), 1000, 0, "chunk-000000.000000", 400);
    create_ongoing_chunk(dir.path(), 1000, 1, "chunk-000001.000000");

    let mut bytes = std::fs::read(&first).unwrap();
    bytes[300] ^= 0x55;
    std::fs::write(&first, bytes).unwrap();

    let db = db_with(dir.path(), 1000, at(1000));
    db.open(OpenOptions::default()).unwrap();
    assert!(!db.wait_for_verification());
    assert!(db.verification_failed());
}

#[test]
fn failed_verification_blocks_writer_and_chaser() {
    let dir = tempdir().unwrap();
    let first = create_completed_chunk(dir.path(), 1000, 0, "chunk-000000.000000", 400);
    create_ongoing_chunk(dir.path(), 1000, 1, "chunk-000001.000000");

    let mut bytes = std::fs::read(&first).unwrap();
    bytes[200] ^= 0x0F;
    std::fs::write(&first, bytes).unwrap();

    let db = db_with(dir.path(), 1000, at(1000));
    db.open(OpenOptions::default()).unwrap();
    assert!(!db.wait_for_verification());
    let db = Arc::new(db);

    assert!(matches!(
        TfChunkWriter::open(Arc::clone(&db)).map(|_| ()),
        Err(Error::CorruptDatabase(CorruptionError::HashValidation(_)))
    ));

    let checkpoints = db.checkpoints();
    let mut chaser = TfChunkChaser::new(
        Arc::clone(&db),
        Arc::clone(&checkpoints.writer),
        Arc::clone(&checkpoints.chaser),
    )
    .unwrap();
    assert!(matches!(
        corruption(chaser.open()),
        CorruptionError::HashValidation(_)
    ));
}

#[test]
fn read_only_open_refuses_pending_truncation() {
    let dir = tempdir().unwrap();
    let checkpoints = at(0);
    checkpoints.truncate.write(0);
    checkpoints.truncate.flush().unwrap();
    let db = db_with(dir.path(), 100, checkpoints);
    assert!(matches!(
        db.open(OpenOptions::read_only()),
        Err(Error::InvalidOperation(_))
    ));
}
