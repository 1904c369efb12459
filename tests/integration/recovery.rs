//! Crash recovery integration tests.
//!
//! A "crash" here is dropping the engine and storage handles and
//! reopening the same directory. These tests verify:
//! - Committed transactions survive restart through redo replay alone
//! - Checkpoints move data into chunks and truncate the redo log
//! - Uncommitted work never reappears
//! - A torn redo tail is clipped without losing earlier commits
//! - The id counter restarts above all persisted history

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::sync::Arc;

use bytes::Bytes;
use strata::{Storage, StorageConfig, TransactionEngine};
use tempfile::tempdir;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn open(dir: &std::path::Path, config: StorageConfig) -> (Storage, Arc<TransactionEngine>) {
    let storage = Storage::open(dir, config.clone()).unwrap();
    let engine = TransactionEngine::open(&storage, config).unwrap();
    (storage, engine)
}

fn commit_one(storage: &Storage, engine: &Arc<TransactionEngine>, key: &str, value: &str) {
    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", storage).unwrap();
    map.put(bytes(key), bytes(value)).unwrap();
    tx.commit().unwrap();
}

fn read_one(storage: &Storage, engine: &Arc<TransactionEngine>, key: &str) -> Option<Bytes> {
    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", storage).unwrap();
    let value = map.get(key.as_bytes());
    tx.rollback().unwrap();
    value
}

#[test]
fn committed_data_survives_restart_via_redo_replay() {
    let dir = tempdir().unwrap();
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        commit_one(&storage, &engine, "a", "1");
        commit_one(&storage, &engine, "b", "2");
        engine.close();
        // No checkpoint: nothing was ever saved to a chunk.
    }
    let (storage, engine) = open(dir.path(), StorageConfig::default());
    assert_eq!(read_one(&storage, &engine, "a"), Some(bytes("1")));
    assert_eq!(read_one(&storage, &engine, "b"), Some(bytes("2")));
    engine.close();
}

#[test]
fn checkpoint_truncates_the_redo_log_and_keeps_data() {
    let dir = tempdir().unwrap();
    let redo_path = dir.path().join("redo.log");
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        commit_one(&storage, &engine, "a", "1");
        let before = std::fs::metadata(&redo_path).unwrap().len();
        engine.checkpoint().unwrap();
        let after = std::fs::metadata(&redo_path).unwrap().len();
        assert!(after < before, "checkpoint should shrink the redo log");
        engine.close();
    }
    let (storage, engine) = open(dir.path(), StorageConfig::default());
    assert_eq!(read_one(&storage, &engine, "a"), Some(bytes("1")));
    engine.close();
}

#[test]
fn redo_replay_overrides_older_chunk_data() {
    let dir = tempdir().unwrap();
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        commit_one(&storage, &engine, "a", "old");
        engine.checkpoint().unwrap();
        // This commit lives only in the redo log.
        commit_one(&storage, &engine, "a", "new");
        engine.close();
    }
    let (storage, engine) = open(dir.path(), StorageConfig::default());
    assert_eq!(read_one(&storage, &engine, "a"), Some(bytes("new")));
    // Replay drained: a fresh checkpoint goes through.
    engine.checkpoint().unwrap();
    engine.close();
}

#[test]
fn uncommitted_writes_do_not_survive() {
    let dir = tempdir().unwrap();
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        commit_one(&storage, &engine, "kept", "yes");
        let tx = engine.begin().unwrap();
        let map = tx.open_map("kv", &storage).unwrap();
        map.put(bytes("lost"), bytes("no")).unwrap();
        // Neither committed nor rolled back.
        engine.close();
    }
    let (storage, engine) = open(dir.path(), StorageConfig::default());
    assert_eq!(read_one(&storage, &engine, "kept"), Some(bytes("yes")));
    assert_eq!(read_one(&storage, &engine, "lost"), None);
    engine.close();
}

#[test]
fn torn_redo_tail_is_clipped() {
    let dir = tempdir().unwrap();
    let redo_path = dir.path().join("redo.log");
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        commit_one(&storage, &engine, "first", "1");
        commit_one(&storage, &engine, "second", "2");
        engine.close();
    }
    // Chop into the middle of the last frame, as a crash mid-append
    // would.
    let full = std::fs::metadata(&redo_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&redo_path).unwrap();
    file.set_len(full - 3).unwrap();
    drop(file);

    let (storage, engine) = open(dir.path(), StorageConfig::default());
    assert_eq!(read_one(&storage, &engine, "first"), Some(bytes("1")));
    assert_eq!(read_one(&storage, &engine, "second"), None);
    engine.close();
}

#[test]
fn id_counter_restarts_above_persisted_history() {
    let dir = tempdir().unwrap();
    {
        let (storage, engine) = open(dir.path(), StorageConfig::default());
        for i in 0..5 {
            commit_one(&storage, &engine, "k", &i.to_string());
        }
        engine.checkpoint().unwrap();
        engine.close();
    }
    let (storage, engine) = open(dir.path(), StorageConfig::default());
    let store = storage.open_map("kv").unwrap();
    assert!(store.max_saved_ts() > 0);
    let tx = engine.begin().unwrap();
    assert!(tx.tid() > store.max_saved_ts());
    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn periodic_sync_commits_survive_a_clean_close() {
    let dir = tempdir().unwrap();
    {
        let (storage, engine) = open(dir.path(), StorageConfig::fast());
        commit_one(&storage, &engine, "batched", "v");
        engine.close();
    }
    let (storage, engine) = open(dir.path(), StorageConfig::fast());
    assert_eq!(read_one(&storage, &engine, "batched"), Some(bytes("v")));
    engine.close();
}
