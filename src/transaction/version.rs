//! Row version chains.
//!
//! Every key in a store maps to the head of a singly linked chain of
//! [`RowVersion`] nodes, newest first. Writers push a new uncommitted
//! head; readers walk the chain until they find a version their
//! isolation level lets them see. Commit is a single atomic store of the
//! commit timestamp into the head node, so readers never block on
//! writers and vice versa.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::transaction::IsolationLevel;
use crate::types::TxId;

/// Writer id used for versions loaded from disk or replayed from the
/// redo log. Never matches a live transaction.
pub const BASE_WRITER: TxId = 0;

/// One immutable version of a row.
///
/// `commit_ts` is zero while the writing transaction is still open and
/// becomes the commit timestamp exactly once, after the commit is
/// durable. A `payload` of `None` is a tombstone: the row was deleted by
/// this version.
pub struct RowVersion {
    writer: TxId,
    commit_ts: AtomicU64,
    payload: Option<Bytes>,
    prev: Mutex<Option<Arc<RowVersion>>>,
}

impl RowVersion {
    /// New uncommitted version owned by `writer`, stacked on `prev`.
    pub fn new_uncommitted(
        writer: TxId,
        payload: Option<Bytes>,
        prev: Option<Arc<RowVersion>>,
    ) -> Arc<RowVersion> {
        Arc::new(RowVersion {
            writer,
            commit_ts: AtomicU64::new(0),
            payload,
            prev: Mutex::new(prev),
        })
    }

    /// Already committed version with no live owner, as produced by
    /// chunk loads and redo replay.
    pub fn committed_base(commit_ts: TxId, payload: Option<Bytes>) -> Arc<RowVersion> {
        Arc::new(RowVersion {
            writer: BASE_WRITER,
            commit_ts: AtomicU64::new(commit_ts),
            payload,
            prev: Mutex::new(None),
        })
    }

    /// Transaction that wrote this version.
    pub fn writer(&self) -> TxId {
        self.writer
    }

    /// Commit timestamp, zero while uncommitted.
    pub fn commit_ts(&self) -> TxId {
        self.commit_ts.load(Ordering::Acquire)
    }

    /// True once the version has a commit timestamp.
    pub fn is_committed(&self) -> bool {
        self.commit_ts() != 0
    }

    /// Publishes the commit timestamp. Idempotent: only the first call
    /// sticks, so a raced duplicate finalize cannot rewrite history.
    pub fn commit(&self, ts: TxId) {
        let _ = self
            .commit_ts
            .compare_exchange(0, ts, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Payload, `None` for tombstones.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Next older version.
    pub fn prev(&self) -> Option<Arc<RowVersion>> {
        self.prev.lock().clone()
    }

    pub(crate) fn set_prev(&self, prev: Option<Arc<RowVersion>>) {
        *self.prev.lock() = prev;
    }

    /// True when `viewer` may read this version under `isolation`.
    fn visible_under(&self, viewer: TxId, isolation: IsolationLevel) -> bool {
        if self.writer == viewer {
            return true;
        }
        let ts = self.commit_ts();
        match isolation {
            IsolationLevel::ReadUncommitted => true,
            IsolationLevel::ReadCommitted => ts != 0,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                ts != 0 && ts < viewer
            }
        }
    }

    /// Walks the chain from this head and returns the payload the
    /// viewer is allowed to see, or `None` when no version is visible
    /// (including a visible tombstone).
    pub fn visible_payload(&self, viewer: TxId, isolation: IsolationLevel) -> Option<Bytes> {
        if self.visible_under(viewer, isolation) {
            return self.payload.clone();
        }
        let mut node = self.prev();
        while let Some(v) = node {
            if v.visible_under(viewer, isolation) {
                return v.payload.clone();
            }
            node = v.prev();
        }
        None
    }

    /// Newest committed version in the chain, as (timestamp, payload).
    pub fn latest_committed(&self) -> Option<(TxId, Option<Bytes>)> {
        let ts = self.commit_ts();
        if ts != 0 {
            return Some((ts, self.payload.clone()));
        }
        let mut node = self.prev();
        while let Some(v) = node {
            let ts = v.commit_ts();
            if ts != 0 {
                return Some((ts, v.payload.clone()));
            }
            node = v.prev();
        }
        None
    }

    /// Cuts the chain below the newest version every active transaction
    /// can still see. `watermark` is the oldest live transaction id; a
    /// committed version with `ts <= watermark` satisfies every current
    /// and future snapshot, so everything older is unreachable.
    pub fn prune_older(&self, watermark: TxId) {
        if self.is_committed() && self.commit_ts() <= watermark {
            self.set_prev(None);
            return;
        }
        let mut node = self.prev();
        while let Some(v) = node {
            if v.is_committed() && v.commit_ts() <= watermark {
                v.set_prev(None);
                return;
            }
            node = v.prev();
        }
    }

    /// Number of versions in the chain, including this one.
    #[cfg(test)]
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut node = self.prev();
        while let Some(v) = node {
            n += 1;
            node = v.prev();
        }
        n
    }
}

impl std::fmt::Debug for RowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowVersion")
            .field("writer", &self.writer)
            .field("commit_ts", &self.commit_ts())
            .field("tombstone", &self.payload.is_none())
            .finish()
    }
}
