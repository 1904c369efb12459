//! Transaction lifecycle integration tests.
//!
//! These tests verify:
//! - Commit visibility and rollback across transactions
//! - Commit timestamps minted only after durability, strictly increasing
//! - Savepoints: partial rollback, pruning, idempotent id-based form
//! - Closed-transaction and unknown-savepoint error surfaces
//! - Isolation levels over the same version chains
//! - The asynchronous commit continuation

#![allow(missing_docs)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strata::{
    IsolationLevel, Storage, StorageConfig, StrataError, TransactionEngine,
};
use tempfile::tempdir;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn open(dir: &std::path::Path, config: StorageConfig) -> (Storage, Arc<TransactionEngine>) {
    let storage = Storage::open(dir, config.clone()).unwrap();
    let engine = TransactionEngine::open(&storage, config).unwrap();
    (storage, engine)
}

#[test]
fn committed_writes_are_visible_and_rolled_back_ones_are_not() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("committed"), bytes("yes")).unwrap();
    tx.commit().unwrap();

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("discarded"), bytes("no")).unwrap();
    tx.rollback().unwrap();

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    assert_eq!(map.get(b"committed"), Some(bytes("yes")));
    assert_eq!(map.get(b"discarded"), None);
    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn commit_timestamps_follow_durability() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::default());

    let first = engine.begin().unwrap();
    let map = first.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    assert_eq!(first.commit_ts(), 0);
    first.commit().unwrap();
    let ts1 = first.commit_ts();
    assert!(ts1 > first.tid());

    let second = engine.begin().unwrap();
    let map = second.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("2")).unwrap();
    second.commit().unwrap();
    let ts2 = second.commit_ts();
    assert!(ts2 > ts1);
    engine.close();
}

#[test]
fn savepoint_rollback_reverts_later_writes_only() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    map.put(bytes("b"), bytes("2")).unwrap();
    tx.add_savepoint("mid").unwrap();
    map.put(bytes("b"), bytes("overwritten")).unwrap();
    map.put(bytes("c"), bytes("3")).unwrap();

    tx.rollback_to_savepoint("mid").unwrap();
    assert_eq!(map.get(b"a"), Some(bytes("1")));
    assert_eq!(map.get(b"b"), Some(bytes("2")));
    assert_eq!(map.get(b"c"), None);

    // The savepoint and everything after it are gone.
    assert!(matches!(
        tx.rollback_to_savepoint("mid"),
        Err(StrataError::SavepointInvalid(_))
    ));
    assert!(matches!(
        tx.rollback_to_savepoint("never-existed"),
        Err(StrataError::SavepointInvalid(_))
    ));

    tx.commit().unwrap();
    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    assert_eq!(map.get(b"b"), Some(bytes("2")));
    assert_eq!(map.get(b"c"), None);
    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn savepoint_id_rollback_is_idempotent() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    let id = tx.savepoint_id().unwrap();
    map.put(bytes("a"), bytes("9")).unwrap();
    map.put(bytes("c"), bytes("3")).unwrap();

    tx.rollback_to_savepoint_id(id).unwrap();
    assert_eq!(map.get(b"a"), Some(bytes("1")));
    assert_eq!(map.get(b"c"), None);

    // Again, with nothing left to revert: same state, no error.
    tx.rollback_to_savepoint_id(id).unwrap();
    assert_eq!(map.get(b"a"), Some(bytes("1")));
    assert_eq!(map.get(b"c"), None);

    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn stale_savepoint_ids_are_rejected() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    let id = tx.savepoint_id().unwrap();

    // An id the log never issued must not quietly succeed.
    assert!(matches!(
        tx.rollback_to_savepoint_id(id + 41),
        Err(StrataError::SavepointInvalid(_))
    ));
    // The current position itself is fine: nothing to revert.
    tx.rollback_to_savepoint_id(id).unwrap();
    assert_eq!(map.get(b"a"), Some(bytes("1")));

    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn nested_savepoints_unwind_in_order() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("base"), bytes("0")).unwrap();
    tx.add_savepoint("outer").unwrap();
    map.put(bytes("one"), bytes("1")).unwrap();
    tx.add_savepoint("inner").unwrap();
    map.put(bytes("two"), bytes("2")).unwrap();

    tx.rollback_to_savepoint("inner").unwrap();
    assert_eq!(map.get(b"one"), Some(bytes("1")));
    assert_eq!(map.get(b"two"), None);

    tx.rollback_to_savepoint("outer").unwrap();
    assert_eq!(map.get(b"base"), Some(bytes("0")));
    assert_eq!(map.get(b"one"), None);
    // Unwinding "outer" pruned "inner" with it.
    assert!(tx.rollback_to_savepoint("inner").is_err());

    tx.rollback().unwrap();
    engine.close();
}

#[test]
fn operations_on_a_closed_transaction_fail() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    tx.commit().unwrap();
    assert!(tx.is_closed());

    assert!(matches!(
        map.put(bytes("b"), bytes("2")),
        Err(StrataError::TransactionClosed(_))
    ));
    assert!(matches!(tx.commit(), Err(StrataError::TransactionClosed(_))));
    assert!(matches!(
        tx.rollback(),
        Err(StrataError::TransactionClosed(_))
    ));
    assert!(matches!(
        tx.add_savepoint("s"),
        Err(StrataError::TransactionClosed(_))
    ));
    assert!(matches!(
        tx.rollback_to_savepoint_id(0),
        Err(StrataError::TransactionClosed(_))
    ));
    engine.close();
}

#[test]
fn isolation_levels_see_different_versions() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let setup = engine.begin().unwrap();
    let map = setup.open_map("kv", &storage).unwrap();
    map.put(bytes("k"), bytes("old")).unwrap();
    setup.commit().unwrap();

    let repeatable = engine
        .begin_with(IsolationLevel::RepeatableRead, false)
        .unwrap();
    let r_map = repeatable.open_map("kv", &storage).unwrap();
    let committed = engine.begin().unwrap();
    let c_map = committed.open_map("kv", &storage).unwrap();
    let dirty = engine
        .begin_with(IsolationLevel::ReadUncommitted, false)
        .unwrap();
    let d_map = dirty.open_map("kv", &storage).unwrap();

    let writer = engine.begin().unwrap();
    let w_map = writer.open_map("kv", &storage).unwrap();
    w_map.put(bytes("k"), bytes("new")).unwrap();

    // Uncommitted: only the dirty reader sees it.
    assert_eq!(r_map.get(b"k"), Some(bytes("old")));
    assert_eq!(c_map.get(b"k"), Some(bytes("old")));
    assert_eq!(d_map.get(b"k"), Some(bytes("new")));

    writer.commit().unwrap();

    // Committed after the repeatable reader began: still invisible to
    // it, visible to read-committed.
    assert_eq!(r_map.get(b"k"), Some(bytes("old")));
    assert_eq!(c_map.get(b"k"), Some(bytes("new")));
    assert_eq!(d_map.get(b"k"), Some(bytes("new")));

    repeatable.rollback().unwrap();
    committed.rollback().unwrap();
    dirty.rollback().unwrap();
    engine.close();
}

#[test]
fn async_commit_completes_and_publishes() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::default());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("async"), bytes("yes")).unwrap();

    let (sender, receiver) = mpsc::channel();
    tx.async_commit(Box::new(move |result| {
        sender.send(result.is_ok()).unwrap();
    }))
    .unwrap();
    assert!(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(tx.is_closed());
    assert!(tx.commit_ts() > 0);

    let check = engine.begin().unwrap();
    let map = check.open_map("kv", &storage).unwrap();
    assert_eq!(map.get(b"async"), Some(bytes("yes")));
    check.rollback().unwrap();
    engine.close();
}

#[test]
fn abandoned_transactions_are_reverted_at_close() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("leak"), bytes("v")).unwrap();
    drop(map);
    drop(tx); // no commit, no rollback

    engine.close();

    let store = storage.open_map("kv").unwrap();
    assert!(store.get(b"leak").is_none());
}

#[test]
fn transaction_metadata_accessors() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path(), StorageConfig::ephemeral());

    let tx = engine
        .begin_with(IsolationLevel::Serializable, true)
        .unwrap();
    assert!(tx.is_auto_commit());
    assert_eq!(tx.isolation(), IsolationLevel::Serializable);
    assert!(tx.name().ends_with(&tx.tid().to_string()));

    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("a"), bytes("1")).unwrap();
    let locks = tx.held_locks();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].0, "kv");
    assert_eq!(locks[0].1, bytes("a"));
    tx.rollback().unwrap();
    engine.close();
}
