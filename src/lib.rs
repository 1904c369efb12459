//! Strata: an embeddable storage engine with chunk-organized
//! copy-on-write B-trees and an MVCC transaction layer.
//!
//! Data lives in named maps. Each map persists as a sequence of
//! append-only chunk files holding immutable pages; saves write fresh
//! pages and retire the old ones, and a compactor reclaims chunks once
//! enough of their pages are garbage. Transactions get multi-version
//! rows with undo-based rollback and savepoints, redo-log durability
//! with group commit, and cooperative (never thread-blocking) row
//! locks.
//!
//! ```no_run
//! use strata::{Storage, StorageConfig, TransactionEngine};
//!
//! # fn main() -> strata::Result<()> {
//! let config = StorageConfig::default();
//! let storage = Storage::open("./db", config.clone())?;
//! let engine = TransactionEngine::open(&storage, config)?;
//!
//! let tx = engine.begin()?;
//! let users = tx.open_map("users", &storage)?;
//! users.put("alice".into(), "1".into())?;
//! tx.commit()?;
//! engine.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod storage;
pub mod transaction;
pub mod types;

pub use config::{StorageConfig, SyncMode};
pub use storage::{BTreeStore, Storage};
pub use transaction::{
    IsolationLevel, LocalSession, Session, SessionStatus, Transaction, TransactionEngine,
    TransactionListener, TransactionMap, WriteOutcome,
};
pub use types::{ChunkId, PagePos, Result, StrataError, TxId};
