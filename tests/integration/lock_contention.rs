//! Row-lock contention integration tests.
//!
//! These tests verify:
//! - A writer blocked on another transaction's row parks and is woken
//!   by the holder's finalize, never busy-waiting forever
//! - Concurrent finalize attempts on one transaction id have exactly
//!   one winner
//! - Heavily contended lock-then-increment traffic loses no updates

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use strata::{
    LocalSession, Session, SessionStatus, Storage, StorageConfig, TransactionEngine,
    WriteOutcome,
};
use tempfile::tempdir;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn open(dir: &std::path::Path) -> (Arc<Storage>, Arc<TransactionEngine>) {
    let config = StorageConfig::ephemeral();
    let storage = Arc::new(Storage::open(dir, config.clone()).unwrap());
    let engine = TransactionEngine::open(&storage, config).unwrap();
    (storage, engine)
}

#[test]
fn blocked_writer_wakes_on_holder_commit() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path());

    let holder = engine.begin().unwrap();
    let hmap = holder.open_map("kv", &storage).unwrap();
    hmap.put(bytes("k"), bytes("holder")).unwrap();

    let contender = {
        let storage = Arc::clone(&storage);
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let session = LocalSession::new();
            let tx = engine.begin().unwrap();
            tx.set_session(session);
            let map = tx.open_map("kv", &storage).unwrap();
            // Parks until the holder finalizes.
            let prior = map.put(bytes("k"), bytes("contender")).unwrap();
            tx.commit().unwrap();
            prior
        })
    };

    // Give the contender time to park behind the lock.
    thread::sleep(Duration::from_millis(100));
    holder.commit().unwrap();

    let prior = contender.join().unwrap();
    assert_eq!(prior, Some(bytes("holder")));

    let check = engine.begin().unwrap();
    let map = check.open_map("kv", &storage).unwrap();
    assert_eq!(map.get(b"k"), Some(bytes("contender")));
    check.rollback().unwrap();
    engine.close();
}

#[test]
fn blocked_writer_wakes_on_holder_rollback() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path());

    let seed = engine.begin().unwrap();
    seed.open_map("kv", &storage)
        .unwrap()
        .put(bytes("k"), bytes("base"))
        .unwrap();
    seed.commit().unwrap();

    let holder = engine.begin().unwrap();
    let hmap = holder.open_map("kv", &storage).unwrap();
    hmap.put(bytes("k"), bytes("doomed")).unwrap();

    let contender = {
        let storage = Arc::clone(&storage);
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let session = LocalSession::new();
            let tx = engine.begin().unwrap();
            tx.set_session(session);
            let map = tx.open_map("kv", &storage).unwrap();
            let prior = map.put(bytes("k"), bytes("winner")).unwrap();
            tx.commit().unwrap();
            prior
        })
    };

    thread::sleep(Duration::from_millis(100));
    holder.rollback().unwrap();

    // The rolled-back value never existed for the contender.
    assert_eq!(contender.join().unwrap(), Some(bytes("base")));
    engine.close();
}

#[test]
fn concurrent_finalize_has_exactly_one_winner() {
    let dir = tempdir().unwrap();
    let (_storage, engine) = open(dir.path());

    let tx = engine.begin().unwrap();
    let tid = tx.tid();
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.commit_final(tid)
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
    assert!(tx.is_closed());
    assert_eq!(engine.active_count(), 0);
    engine.close();
}

#[test]
fn finalize_after_commit_is_a_no_op() {
    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path());

    let tx = engine.begin().unwrap();
    let map = tx.open_map("kv", &storage).unwrap();
    map.put(bytes("k"), bytes("v")).unwrap();
    tx.commit().unwrap();
    assert!(!engine.commit_final(tx.tid()));

    let check = engine.begin().unwrap();
    let map = check.open_map("kv", &storage).unwrap();
    assert_eq!(map.get(b"k"), Some(bytes("v")));
    check.rollback().unwrap();
    engine.close();
}

#[test]
fn contended_increments_lose_no_updates() {
    const THREADS: usize = 4;
    const INCREMENTS: usize = 25;

    let dir = tempdir().unwrap();
    let (storage, engine) = open(dir.path());

    let seed = engine.begin().unwrap();
    seed.open_map("counters", &storage)
        .unwrap()
        .put(bytes("n"), bytes("0"))
        .unwrap();
    seed.commit().unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let storage = Arc::clone(&storage);
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..INCREMENTS {
                    let session = LocalSession::new();
                    let tx = engine.begin().unwrap();
                    tx.set_session(session.clone());
                    let map = tx.open_map("counters", &storage).unwrap();
                    loop {
                        match map.try_lock(bytes("n")).unwrap() {
                            WriteOutcome::Complete(current) => {
                                session.set_lock_wait(SessionStatus::Running, None, None);
                                let n: u64 = String::from_utf8(current.unwrap().to_vec())
                                    .unwrap()
                                    .parse()
                                    .unwrap();
                                map.put(bytes("n"), Bytes::from((n + 1).to_string()))
                                    .unwrap();
                                break;
                            }
                            WriteOutcome::NeedWait => {
                                session.transaction_listener().await_wake();
                            }
                            WriteOutcome::NeedRetry => thread::yield_now(),
                        }
                    }
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let check = engine.begin().unwrap();
    let map = check.open_map("counters", &storage).unwrap();
    let total = String::from_utf8(map.get(b"n").unwrap().to_vec()).unwrap();
    assert_eq!(total, (THREADS * INCREMENTS).to_string());
    check.rollback().unwrap();
    engine.close();
}
