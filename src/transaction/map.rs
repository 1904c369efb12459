//! A transaction's view of one key-value map.
//!
//! Writes install uncommitted versions optimistically with a head CAS.
//! A key whose head belongs to another open transaction cannot be
//! written; the caller either parks on the holder (`NeedWait`) or
//! retries after re-reading (`NeedRetry`). Reads never block: they
//! walk the version chain for the newest version visible under the
//! transaction's isolation level.

use std::sync::Arc;

use bytes::Bytes;

use crate::storage::BTreeStore;
use crate::transaction::session::SessionStatus;
use crate::transaction::tx::{Transaction, WaitOutcome};
use crate::transaction::version::RowVersion;
use crate::types::{Result, TxId};

/// Result of a non-blocking write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write is installed; carries the prior visible value.
    Complete(Option<Bytes>),
    /// Another transaction holds the row; the caller was queued for a
    /// wake-up (when it has a session) and should park.
    NeedWait,
    /// The holder finished in the middle of the attempt; re-read and
    /// try again immediately.
    NeedRetry,
}

/// Map handle bound to one transaction.
pub struct TransactionMap {
    tx: Arc<Transaction>,
    store: Arc<BTreeStore>,
}

impl TransactionMap {
    pub(crate) fn new(tx: Arc<Transaction>, store: Arc<BTreeStore>) -> TransactionMap {
        TransactionMap { tx, store }
    }

    /// The map name.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// The owning transaction.
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub(crate) fn store(&self) -> &Arc<BTreeStore> {
        &self.store
    }

    /// Newest value visible to this transaction, or `None` when the
    /// key is absent, deleted, or only written by unfinished peers.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let head = self.store.get(key)?;
        head.visible_payload(self.tx.tid(), self.tx.isolation())
    }

    /// Installs `value` under `key`, parking while another transaction
    /// holds the row. Returns the prior visible value.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        self.write_blocking(key, Some(value))
    }

    /// Installs a deletion marker, parking like [`TransactionMap::put`].
    pub fn remove(&self, key: Bytes) -> Result<Option<Bytes>> {
        self.write_blocking(key, None)
    }

    /// Non-blocking [`TransactionMap::put`].
    pub fn try_put(&self, key: Bytes, value: Bytes) -> Result<WriteOutcome> {
        self.try_write(key, Some(value))
    }

    /// Non-blocking [`TransactionMap::remove`].
    pub fn try_remove(&self, key: Bytes) -> Result<WriteOutcome> {
        self.try_write(key, None)
    }

    /// Write-locks `key` without changing its value, by installing an
    /// uncommitted version that carries the current one. An absent key
    /// completes immediately with nothing to lock.
    pub fn try_lock(&self, key: Bytes) -> Result<WriteOutcome> {
        self.tx.check_not_closed()?;
        let tid = self.tx.tid();
        loop {
            let head = match self.store.get(&key) {
                Some(head) => head,
                None => return Ok(WriteOutcome::Complete(None)),
            };
            if !head.is_committed() {
                if head.writer() == tid {
                    return Ok(WriteOutcome::Complete(head.payload().cloned()));
                }
                return Ok(self.wait_on_holder(&key, head.writer()));
            }
            let value = head.payload().cloned();
            let new = RowVersion::new_uncommitted(tid, value.clone(), Some(Arc::clone(&head)));
            if !self.store.cas_head(&key, Some(&head), Arc::clone(&new)) {
                continue;
            }
            return self.finish_write(key, Some(head), new, value);
        }
    }

    fn try_write(&self, key: Bytes, payload: Option<Bytes>) -> Result<WriteOutcome> {
        self.tx.check_not_closed()?;
        let tid = self.tx.tid();
        loop {
            let head = match self.store.get(&key) {
                Some(head) => head,
                None => {
                    let new = RowVersion::new_uncommitted(tid, payload.clone(), None);
                    if !self.store.cas_head(&key, None, Arc::clone(&new)) {
                        continue;
                    }
                    return self.finish_write(key, None, new, None);
                }
            };
            let prior = head.visible_payload(tid, self.tx.isolation());
            if head.is_committed() {
                // Stack a new uncommitted version on committed history.
                let new = RowVersion::new_uncommitted(
                    tid,
                    payload.clone(),
                    Some(Arc::clone(&head)),
                );
                if !self.store.cas_head(&key, Some(&head), Arc::clone(&new)) {
                    continue;
                }
                return self.finish_write(key, Some(head), new, prior);
            }
            if head.writer() == tid {
                // Rewriting our own row: collapse onto the version we
                // displaced originally so the chain stays short, and
                // undo the displaced head on partial rollback.
                let new = RowVersion::new_uncommitted(tid, payload.clone(), head.prev());
                if !self.store.cas_head(&key, Some(&head), Arc::clone(&new)) {
                    continue;
                }
                return self.finish_write(key, Some(head), new, prior);
            }
            return Ok(self.wait_on_holder(&key, head.writer()));
        }
    }

    /// Undo bookkeeping after a successful head install. A failure
    /// (transaction closed underneath us) takes the install back out.
    fn finish_write(
        &self,
        key: Bytes,
        old: Option<Arc<RowVersion>>,
        new: Arc<RowVersion>,
        prior: Option<Bytes>,
    ) -> Result<WriteOutcome> {
        match self.tx.record_write(&self.store, key.clone(), old.clone(), new) {
            Ok(_) => Ok(WriteOutcome::Complete(prior)),
            Err(err) => {
                match old {
                    Some(old_head) => {
                        self.store.put_head(key, old_head);
                    }
                    None => {
                        self.store.remove_head(&key);
                    }
                }
                Err(err)
            }
        }
    }

    fn wait_on_holder(&self, key: &Bytes, writer: TxId) -> WriteOutcome {
        let holder = match self.tx.engine().find_transaction(writer) {
            Some(holder) => holder,
            // Finalized already; its version will read as committed.
            None => return WriteOutcome::NeedRetry,
        };
        match holder.add_waiting_transaction(key, &self.tx) {
            WaitOutcome::NeedWait => WriteOutcome::NeedWait,
            WaitOutcome::NeedRetry => WriteOutcome::NeedRetry,
        }
    }

    fn write_blocking(&self, key: Bytes, payload: Option<Bytes>) -> Result<Option<Bytes>> {
        loop {
            match self.try_write(key.clone(), payload.clone())? {
                WriteOutcome::Complete(prior) => {
                    self.clear_wait_state();
                    return Ok(prior);
                }
                WriteOutcome::NeedWait => self.park(),
                WriteOutcome::NeedRetry => std::thread::yield_now(),
            }
        }
    }

    fn park(&self) {
        match self.tx.session() {
            Some(session) => session.transaction_listener().await_wake(),
            None => std::thread::yield_now(),
        }
    }

    fn clear_wait_state(&self) {
        if let Some(session) = self.tx.session() {
            if matches!(
                session.status(),
                SessionStatus::Waiting | SessionStatus::Retrying
            ) {
                session.set_lock_wait(SessionStatus::Running, None, None);
            }
        }
    }
}
