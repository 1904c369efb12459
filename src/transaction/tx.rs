//! A single MVCC transaction: undo log, savepoints, commit and
//! rollback, and the cooperative lock-wait protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::warn;

use crate::storage::{BTreeStore, Storage};
use crate::transaction::log::{LobTask, RedoRecord};
use crate::transaction::map::TransactionMap;
use crate::transaction::session::{Session, SessionStatus, TransactionListener};
use crate::transaction::undo::{UndoEntry, UndoLog};
use crate::transaction::version::RowVersion;
use crate::transaction::{IsolationLevel, TransactionEngine};
use crate::types::{Result, StrataError, TxId};

/// What a writer blocked on an uncommitted row should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Park until the holder finalizes and wakes its waiters.
    NeedWait,
    /// The holder is already gone; re-read the row and try again.
    NeedRetry,
}

/// A key this transaction holds a write lock on, for diagnostics.
struct RowLock {
    map: String,
    key: Bytes,
}

type CommitCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct TxInner {
    /// `None` once the transaction has committed or rolled back.
    undo: Option<UndoLog>,
    savepoints: HashMap<String, usize>,
    locks: SmallVec<[RowLock; 4]>,
    session: Option<Arc<dyn Session>>,
    lob_task: Option<LobTask>,
    commit_callback: Option<CommitCallback>,
}

pub(crate) struct FinalizeState {
    pub undo: Option<UndoLog>,
    pub session: Option<Arc<dyn Session>>,
}

/// An open transaction. Cheap to share; all mutation goes through the
/// interior lock. Obtain one from [`TransactionEngine::begin`].
pub struct Transaction {
    engine: Arc<TransactionEngine>,
    tid: TxId,
    name: String,
    isolation: IsolationLevel,
    auto_commit: bool,
    /// Zero until the redo record is durable.
    commit_ts: AtomicU64,
    inner: Mutex<TxInner>,
    waiters: Mutex<Vec<Arc<dyn TransactionListener>>>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        tid: TxId,
        name: String,
        isolation: IsolationLevel,
        auto_commit: bool,
    ) -> Transaction {
        Transaction {
            engine,
            tid,
            name,
            isolation,
            auto_commit,
            commit_ts: AtomicU64::new(0),
            inner: Mutex::new(TxInner {
                undo: Some(UndoLog::new()),
                savepoints: HashMap::new(),
                locks: SmallVec::new(),
                session: None,
                lob_task: None,
                commit_callback: None,
            }),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// The transaction id, unique for the engine's lifetime.
    pub fn tid(&self) -> TxId {
        self.tid
    }

    /// Diagnostic name, `host:tid`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The isolation level reads run under.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// True when the owner commits after every statement.
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Commit timestamp, or zero while none has been assigned.
    pub fn commit_ts(&self) -> TxId {
        self.commit_ts.load(Ordering::Acquire)
    }

    /// Attaches the owning session, which supplies the wake-up
    /// listener for lock waits and receives finalize notifications.
    pub fn set_session(&self, session: Arc<dyn Session>) {
        self.inner.lock().session = Some(session);
    }

    pub(crate) fn session(&self) -> Option<Arc<dyn Session>> {
        self.inner.lock().session.clone()
    }

    /// Registers work (typically large-object file writes) that must
    /// complete before this commit's redo record is appended.
    pub fn set_lob_task(&self, task: LobTask) {
        self.inner.lock().lob_task = Some(task);
    }

    /// True once the transaction has committed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().undo.is_none()
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StrataError::TransactionClosed(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    /// The engine-registered handle for this transaction. Present for
    /// exactly as long as the transaction is open.
    fn shared(&self) -> Result<Arc<Transaction>> {
        self.engine
            .find_transaction(self.tid)
            .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))
    }

    /// Opens a named map for reading and writing under this
    /// transaction. First use wires the map into the engine, replaying
    /// any redo records recovered for it.
    pub fn open_map(&self, name: &str, storage: &Storage) -> Result<TransactionMap> {
        self.check_not_closed()?;
        let me = self.shared()?;
        let store = self.engine.open_store(storage, name)?;
        Ok(TransactionMap::new(me, store))
    }

    /// Appends one write to the undo log after its version has been
    /// installed. Returns the entry's log id. The caller reverts the
    /// installed version if this fails.
    pub(crate) fn record_write(
        &self,
        map: &Arc<BTreeStore>,
        key: Bytes,
        old: Option<Arc<RowVersion>>,
        new: Arc<RowVersion>,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let undo = inner
            .undo
            .as_mut()
            .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
        let log_id = undo.append(UndoEntry::new(Arc::clone(map), key.clone(), old, new));
        let map_name = map.name();
        if !inner
            .locks
            .iter()
            .any(|lock| lock.map == map_name && lock.key == key)
        {
            inner.locks.push(RowLock {
                map: map_name.to_string(),
                key,
            });
        }
        Ok(log_id)
    }

    /// Keys currently write-locked by this transaction.
    pub fn held_locks(&self) -> Vec<(String, Bytes)> {
        self.inner
            .lock()
            .locks
            .iter()
            .map(|lock| (lock.map.clone(), lock.key.clone()))
            .collect()
    }

    /// The log id a savepoint set right now would capture.
    pub fn savepoint_id(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let undo = inner
            .undo
            .as_ref()
            .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
        Ok(undo.next_log_id())
    }

    /// Names the current undo position. Re-using a name moves it.
    pub fn add_savepoint(&self, name: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let id = inner
            .undo
            .as_ref()
            .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?
            .next_log_id();
        inner.savepoints.insert(name.to_string(), id);
        Ok(id)
    }

    /// Rolls back to a named savepoint and drops it together with
    /// every savepoint set after it.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let id = {
            let inner = self.inner.lock();
            if inner.undo.is_none() {
                return Err(StrataError::TransactionClosed(self.name.clone()));
            }
            match inner.savepoints.get(name) {
                Some(&id) => id,
                None => return Err(StrataError::SavepointInvalid(name.to_string())),
            }
        };
        self.rollback_entries_to(id)?;
        self.inner.lock().savepoints.retain(|_, &mut v| v < id);
        Ok(())
    }

    /// Rolls back to an undo-log position obtained from
    /// [`Transaction::savepoint_id`]. Safe to repeat: a second call
    /// with the same id finds nothing left to revert. An id past the
    /// current log end was never issued and is rejected.
    pub fn rollback_to_savepoint_id(&self, id: usize) -> Result<()> {
        {
            let inner = self.inner.lock();
            let undo = inner
                .undo
                .as_ref()
                .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
            if id > undo.next_log_id() {
                return Err(StrataError::SavepointInvalid(format!("log id {id}")));
            }
        }
        self.rollback_entries_to(id)
    }

    /// Reverts undo entries down to `to`, newest first. Map heads are
    /// touched outside the transaction lock.
    fn rollback_entries_to(&self, to: usize) -> Result<()> {
        let batch = {
            let mut inner = self.inner.lock();
            let undo = inner
                .undo
                .as_mut()
                .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
            undo.split_off(to)
        };
        for entry in batch.iter().rev() {
            entry.revert();
        }
        Ok(())
    }

    /// Discards every write and closes the transaction. The close-out
    /// (registry removal, lock release, waiter wake-up) runs even if
    /// the revert fails partway.
    pub fn rollback(&self) -> Result<()> {
        self.check_not_closed()?;
        let reverted = self.rollback_entries_to(0);
        self.end_transaction();
        reverted
    }

    /// Commits. Blocks until the redo record is durable, then
    /// finalizes: installed versions get this transaction's commit
    /// timestamp and blocked writers are woken. On a durability error
    /// the transaction stays open so the caller can roll back.
    pub fn commit(&self) -> Result<()> {
        self.check_not_closed()?;
        self.write_redo_log(false)?;
        self.engine.commit_final(self.tid);
        Ok(())
    }

    /// Commits without waiting. `on_complete` runs exactly once, on
    /// the log sync thread, after finalize (or with the durability
    /// error, in which case the transaction stays open).
    pub fn async_commit(&self, on_complete: CommitCallback) -> Result<()> {
        self.check_not_closed()?;
        self.inner.lock().commit_callback = Some(on_complete);
        match self.write_redo_log(true) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.lock().commit_callback = None;
                Err(err)
            }
        }
    }

    /// Routes this commit's record through the log sync service, or
    /// short-circuits when there is nothing to make durable.
    fn write_redo_log(&self, is_async: bool) -> Result<()> {
        let service = self.engine.log_service();
        let (has_writes, lob_task) = {
            let mut inner = self.inner.lock();
            let undo = inner
                .undo
                .as_ref()
                .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
            (!undo.is_empty(), inner.lob_task.take())
        };

        if service.needs_sync() && has_writes {
            let me = self.shared()?;
            let log_id = service.next_log_id();
            let base = if service.is_periodic() {
                // Periodic flushes may never run before more writes
                // land; encode lazily on the sync thread instead.
                RedoRecord::LazyTransaction(Arc::clone(&me))
            } else {
                RedoRecord::Transaction(self.encode_writes()?)
            };
            let record = match lob_task {
                Some(task) => RedoRecord::LobSave {
                    task,
                    record: Box::new(base),
                },
                None => base,
            };
            if is_async {
                service.async_write(&me, record, log_id);
            } else {
                service.sync_write(&me, record, log_id)?;
            }
            return Ok(());
        }

        if let Some(task) = lob_task {
            task().map_err(|err| {
                StrataError::Internal(format!("large-object save failed: {err}"))
            })?;
        }
        if has_writes {
            self.on_synced();
        }
        if is_async {
            self.async_commit_complete();
        }
        Ok(())
    }

    /// Serializes this transaction's writes for the redo log.
    pub(crate) fn encode_writes(&self) -> Result<Bytes> {
        let inner = self.inner.lock();
        let undo = inner
            .undo
            .as_ref()
            .ok_or_else(|| StrataError::TransactionClosed(self.name.clone()))?;
        Ok(crate::transaction::log::record::encode_writes(undo))
    }

    /// Called exactly when this commit's record is durable; mints the
    /// commit timestamp. Until this point readers treat the writes as
    /// uncommitted.
    pub fn on_synced(&self) {
        if self.commit_ts.load(Ordering::Acquire) == 0 {
            let ts = self.engine.next_transaction_id();
            let _ = self
                .commit_ts
                .compare_exchange(0, ts, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Continuation for [`Transaction::async_commit`] after durability.
    pub fn async_commit_complete(&self) {
        self.engine.commit_final(self.tid);
        let callback = self.inner.lock().commit_callback.take();
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    /// Continuation for a failed async durability attempt. The
    /// transaction stays open.
    pub fn async_commit_failed(&self, err: StrataError) {
        let callback = self.inner.lock().commit_callback.take();
        match callback {
            Some(callback) => callback(Err(err)),
            None => warn!(tx = %self.name, error = %err, "async commit failed with no callback"),
        }
    }

    /// True when this transaction is itself parked behind another's
    /// row lock. Queueing behind such a holder risks a wait cycle.
    pub(crate) fn is_waiting(&self) -> bool {
        matches!(
            self.session().map(|session| session.status()),
            Some(SessionStatus::Waiting)
        )
    }

    /// Registers `waiter` to be woken when this transaction (the lock
    /// holder) finalizes. A holder that is closed or itself waiting
    /// sends the caller back to re-read instead. Re-checks after
    /// registration: the holder may finalize concurrently and its
    /// wake-up pass could miss a waiter added after it ran, so losing
    /// that race restores the waiter's session to its prior state.
    pub(crate) fn add_waiting_transaction(
        &self,
        key: &Bytes,
        waiter: &Arc<Transaction>,
    ) -> WaitOutcome {
        if self.is_closed() || self.is_waiting() {
            return WaitOutcome::NeedRetry;
        }
        let session = match waiter.session() {
            Some(session) => session,
            // No session to park; the caller spins with a yield.
            None => return WaitOutcome::NeedWait,
        };
        let prior = session.status();
        let listener = session.transaction_listener();
        session.set_lock_wait(SessionStatus::Waiting, Some(self.tid), Some(key.as_ref()));
        self.waiters.lock().push(listener);
        if self.is_closed() || self.is_waiting() {
            session.set_lock_wait(prior, None, None);
            return WaitOutcome::NeedRetry;
        }
        WaitOutcome::NeedWait
    }

    /// Strips the state finalize needs and closes the transaction.
    pub(crate) fn take_finalize_state(&self) -> FinalizeState {
        let mut inner = self.inner.lock();
        inner.savepoints.clear();
        inner.locks.clear();
        FinalizeState {
            undo: inner.undo.take(),
            session: inner.session.take(),
        }
    }

    /// Wakes every transaction parked on this one.
    pub(crate) fn wake_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.wake_up();
        }
    }

    /// Close-out for the rollback path.
    fn end_transaction(&self) {
        self.engine.remove_transaction(self.tid);
        let state = self.take_finalize_state();
        if let Some(session) = state.session {
            session.on_finalized(false);
        }
        self.wake_waiters();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Last handle gone without commit or rollback: revert what the
        // undo log still holds so no uncommitted head outlives us.
        let inner = self.inner.get_mut();
        if let Some(undo) = inner.undo.as_mut() {
            let entries = undo.split_off(0);
            if !entries.is_empty() {
                warn!(
                    tx = %self.name,
                    writes = entries.len(),
                    "transaction dropped while open; reverting its writes"
                );
                for entry in entries.iter().rev() {
                    entry.revert();
                }
            }
        }
        inner.undo = None;
        let waiters = std::mem::take(self.waiters.get_mut());
        for waiter in waiters {
            waiter.wake_up();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("isolation", &self.isolation)
            .field("commit_ts", &self.commit_ts.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}
