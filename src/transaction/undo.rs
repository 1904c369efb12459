//! Per-transaction undo log.
//!
//! Every transactional write appends one entry recording the store, the
//! key, the head it displaced, and the head it installed. Entry indexes
//! are the savepoint currency: rolling back to log id `n` reverts
//! entries `n..` in reverse order, and commit walks the whole log
//! forward to finalize the installed versions.

use std::sync::Arc;

use bytes::Bytes;

use crate::storage::btree::BTreeStore;
use crate::transaction::version::RowVersion;
use crate::types::TxId;

/// One undone-able write.
pub struct UndoEntry {
    map: Arc<BTreeStore>,
    key: Bytes,
    old: Option<Arc<RowVersion>>,
    new: Arc<RowVersion>,
}

impl UndoEntry {
    /// Records a write that replaced `old` (or created the key when
    /// `old` is `None`) with `new`.
    pub fn new(
        map: Arc<BTreeStore>,
        key: Bytes,
        old: Option<Arc<RowVersion>>,
        new: Arc<RowVersion>,
    ) -> UndoEntry {
        UndoEntry { map, key, old, new }
    }

    /// Puts the displaced head back (or removes the key it created).
    pub fn revert(&self) {
        match &self.old {
            Some(old) => {
                self.map.put_head(self.key.clone(), Arc::clone(old));
            }
            None => {
                self.map.remove_head(&self.key);
            }
        }
    }

    pub(crate) fn map_name(&self) -> &str {
        self.map.name()
    }

    pub(crate) fn key(&self) -> &Bytes {
        &self.key
    }

    /// Payload of the installed version; `None` for deletes.
    pub(crate) fn new_payload(&self) -> Option<&Bytes> {
        self.new.payload()
    }
}

/// Ordered log of a transaction's writes.
#[derive(Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    /// Empty log.
    pub fn new() -> UndoLog {
        UndoLog::default()
    }

    /// Appends an entry, returning its log id.
    pub fn append(&mut self, entry: UndoEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Log id the next write will get. Doubles as the savepoint cursor.
    pub fn next_log_id(&self) -> usize {
        self.entries.len()
    }

    /// True when the transaction wrote nothing (or everything was
    /// rolled back).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Detaches entries `to..` for the caller to revert, newest first.
    pub fn split_off(&mut self, to: usize) -> Vec<UndoEntry> {
        if to >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(to)
    }

    /// Iterates entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &UndoEntry> {
        self.entries.iter()
    }

    /// Finalizes every installed version with the commit timestamp,
    /// prunes chain garbage below the watermark, and dirties the
    /// touched leaves so the next save persists the commit.
    pub fn finalize_commit(self, commit_ts: TxId, watermark: TxId) {
        for entry in &self.entries {
            entry.new.commit(commit_ts);
            entry.new.prune_older(watermark);
            entry.map.touch_dirty(&entry.key);
        }
    }
}
