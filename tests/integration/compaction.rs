//! Chunk compaction integration tests.
//!
//! These tests verify:
//! - Fully-garbage chunks are deleted outright, with their files
//! - Low-fill chunks are rewritten and converge to zero garbage
//! - Every live key stays readable through a compaction pass
//! - A zero minimum fill rate disables rewriting but not deletion
//! - The engine's maintenance trigger drives the same machinery

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use strata::{Storage, StorageConfig, TransactionEngine};
use tempfile::tempdir;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Small pages so a modest key count spreads over many leaves.
fn compacting_config(min_fill_rate: u8) -> StorageConfig {
    StorageConfig {
        min_fill_rate,
        page_split_size: 256,
        ..StorageConfig::ephemeral()
    }
}

fn open(
    dir: &std::path::Path,
    config: StorageConfig,
) -> (Storage, Arc<TransactionEngine>) {
    let storage = Storage::open(dir, config.clone()).unwrap();
    let engine = TransactionEngine::open(&storage, config).unwrap();
    (storage, engine)
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{i:04}"))
}

fn commit_range(
    storage: &Storage,
    engine: &Arc<TransactionEngine>,
    indexes: impl Iterator<Item = usize>,
    tag: &str,
) {
    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", storage).unwrap();
    for i in indexes {
        map.put(key(i), bytes(&format!("{tag}-{i}"))).unwrap();
    }
    tx.commit().unwrap();
}

#[test]
fn fully_garbage_chunks_are_deleted() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), compacting_config(40));

    commit_range(&storage, &engine, 0..100, "first");
    let store = storage.open_map("kv").unwrap();
    assert!(store.save().unwrap());
    let old_ids = store.manager().known_ids_desc();
    assert_eq!(old_ids.len(), 1);
    let old_chunk = old_ids[0];

    // Rewrite every key: every page of the first chunk becomes garbage.
    commit_range(&storage, &engine, 0..100, "second");
    assert!(store.save().unwrap());
    assert!(store.manager().removed_count() > 0);

    store.compact().unwrap();

    assert!(!store.manager().contains_chunk(old_chunk));
    assert!(!store
        .manager()
        .dir()
        .join(old_chunk.file_name())
        .exists());
    for i in 0..100 {
        let tx = engine.begin().unwrap();
        let map = tx.open_map("kv", &storage).unwrap();
        assert_eq!(map.get(&key(i)), Some(bytes(&format!("second-{i}"))));
        tx.rollback().unwrap();
    }
    engine.close();
}

#[test]
fn low_fill_chunks_are_rewritten_until_garbage_free() {
    let dir = tempdir().unwrap();
    // High threshold so a half-garbage chunk qualifies for rewriting.
    let (storage, engine) = open(dir.path(), compacting_config(80));

    commit_range(&storage, &engine, 0..200, "first");
    let store = storage.open_map("kv").unwrap();
    assert!(store.save().unwrap());
    let old_chunk = store.manager().known_ids_desc()[0];

    // Overwrite a contiguous half: some leaves of the old chunk die,
    // the rest stay live there.
    commit_range(&storage, &engine, 0..100, "second");
    assert!(store.save().unwrap());
    assert!(store.manager().contains_chunk(old_chunk));

    store.compact().unwrap();

    // The rewrite migrated the surviving leaves, so the old chunk
    // drained and was deleted.
    assert!(!store.manager().contains_chunk(old_chunk));
    for i in 0..100 {
        let tx = engine.begin().unwrap();
        let map = tx.open_map("kv", &storage).unwrap();
        assert_eq!(map.get(&key(i)), Some(bytes(&format!("second-{i}"))));
        tx.rollback().unwrap();
    }
    for i in 100..200 {
        let tx = engine.begin().unwrap();
        let map = tx.open_map("kv", &storage).unwrap();
        assert_eq!(map.get(&key(i)), Some(bytes(&format!("first-{i}"))));
        tx.rollback().unwrap();
    }
    engine.close();
}

#[test]
fn zero_min_fill_rate_only_deletes_full_garbage() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), compacting_config(0));

    commit_range(&storage, &engine, 0..200, "first");
    let store = storage.open_map("kv").unwrap();
    assert!(store.save().unwrap());
    let old_chunk = store.manager().known_ids_desc()[0];

    commit_range(&storage, &engine, 0..100, "second");
    assert!(store.save().unwrap());
    let garbage_before = store.manager().removed_count();
    assert!(garbage_before > 0);

    store.compact().unwrap();

    // Half-live chunk: rewriting is disabled, so it stays, garbage and
    // all.
    assert!(store.manager().contains_chunk(old_chunk));
    assert_eq!(store.manager().removed_count(), garbage_before);

    // But a fully dead chunk still goes.
    commit_range(&storage, &engine, 100..200, "second");
    assert!(store.save().unwrap());
    store.compact().unwrap();
    assert!(!store.manager().contains_chunk(old_chunk));
    engine.close();
}

#[test]
fn compaction_leaves_all_committed_data_readable() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), compacting_config(90));
    let store = storage.open_map("kv").unwrap();

    // Several generations of overlapping writes and saves.
    for (round, span) in [(0, 0..300), (1, 50..150), (2, 200..280), (3, 0..60)] {
        commit_range(&storage, &engine, span, &format!("round{round}"));
        assert!(store.save().unwrap());
    }
    store.compact().unwrap();
    store.compact().unwrap(); // second pass is a cheap no-op or finishes the job

    let expect = |i: usize| -> Bytes {
        if i < 60 {
            bytes(&format!("round3-{i}"))
        } else if (50..150).contains(&i) {
            bytes(&format!("round1-{i}"))
        } else if (200..280).contains(&i) {
            bytes(&format!("round2-{i}"))
        } else {
            bytes(&format!("round0-{i}"))
        }
    };
    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    for i in 0..300 {
        assert_eq!(map.get(&key(i)), Some(expect(i)), "key {i}");
    }
    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn maintenance_trigger_compacts_wired_stores() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        compact_threshold: 1,
        ..compacting_config(40)
    };
    let (storage, engine) = open(dir.path(), config);

    commit_range(&storage, &engine, 0..100, "first");
    let store = storage.open_map("kv").unwrap();
    assert!(store.save().unwrap());
    let old_chunk = store.manager().known_ids_desc()[0];
    commit_range(&storage, &engine, 0..100, "second");
    assert!(store.save().unwrap());

    engine.trigger_compaction();
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.manager().contains_chunk(old_chunk) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!store.manager().contains_chunk(old_chunk));
    engine.close();
}
