//! Durability scheduling.
//!
//! Committing transactions hand their redo records to a
//! [`LogSyncService`]; a dedicated thread appends and fsyncs them in
//! batches, then drives each transaction's post-durability steps
//! (timestamp minting via `on_synced`, then finalize or the async
//! continuation). Instant mode flushes as soon as records arrive;
//! periodic mode flushes on a timer and trades the tail of recent
//! commits for throughput.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::transaction::log::record::RedoRecord;
use crate::transaction::log::redo_log::RedoLog;
use crate::transaction::tx::Transaction;
use crate::types::{Result, StrataError};

/// Hands commit records to stable storage and reports back.
///
/// Implementations must call `on_synced` on a transaction exactly when
/// its record is durable, then complete the waiting committer (sync) or
/// invoke `async_commit_complete` / `async_commit_failed` (async).
pub trait LogSyncService: Send + Sync {
    /// False when commits skip redo logging entirely.
    fn needs_sync(&self) -> bool {
        true
    }

    /// True when flushes happen on a timer; committers then queue lazy
    /// records instead of encoding eagerly.
    fn is_periodic(&self) -> bool {
        false
    }

    /// Monotonic id for the next queued record.
    fn next_log_id(&self) -> u64;

    /// Records queued or mid-flush whose transactions have not yet
    /// been stamped durable.
    fn in_flight(&self) -> u64 {
        0
    }

    /// Queues the record and blocks until it is durable (or failed).
    fn sync_write(&self, tx: &Arc<Transaction>, record: RedoRecord, log_id: u64) -> Result<()>;

    /// Queues the record and returns; completion reaches the
    /// transaction's continuation on the sync thread.
    fn async_write(&self, tx: &Arc<Transaction>, record: RedoRecord, log_id: u64);

    /// The backing log, when one exists.
    fn redo_log(&self) -> Option<&RedoLog>;

    /// Flushes outstanding work and stops. Callers must have quiesced
    /// committers first.
    fn close(&self);
}

struct SyncTask {
    tx: Arc<Transaction>,
    record: RedoRecord,
    log_id: u64,
    waiter: Option<Arc<CommitNotifier>>,
}

/// One-shot completion slot a synchronous committer parks on.
struct CommitNotifier {
    slot: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl CommitNotifier {
    fn new() -> CommitNotifier {
        CommitNotifier {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<()>) {
        *self.slot.lock() = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.ready.wait(&mut slot);
        }
        match slot.take() {
            Some(result) => result,
            None => Ok(()),
        }
    }
}

struct SyncShared {
    redo: RedoLog,
    queue: Mutex<Vec<SyncTask>>,
    wake: Condvar,
    next_log_id: AtomicU64,
    in_flight: AtomicU64,
    shutdown: AtomicBool,
    interval: Option<Duration>,
}

/// Group-commit durability: one thread batches queued records, writes
/// them, fsyncs once, and completes every committer in the batch.
pub struct GroupCommitSync {
    shared: Arc<SyncShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCommitSync {
    /// Flush as soon as records arrive.
    pub fn start_instant(path: &Path) -> Result<Arc<GroupCommitSync>> {
        Self::start(path, None)
    }

    /// Flush on a fixed interval.
    pub fn start_periodic(path: &Path, interval: Duration) -> Result<Arc<GroupCommitSync>> {
        Self::start(path, Some(interval))
    }

    fn start(path: &Path, interval: Option<Duration>) -> Result<Arc<GroupCommitSync>> {
        let redo = RedoLog::open(path)?;
        let shared = Arc::new(SyncShared {
            redo,
            queue: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            next_log_id: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            interval,
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::spawn(move || run(worker));
        Ok(Arc::new(GroupCommitSync {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

impl LogSyncService for GroupCommitSync {
    fn is_periodic(&self) -> bool {
        self.shared.interval.is_some()
    }

    fn next_log_id(&self) -> u64 {
        self.shared.next_log_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn sync_write(&self, tx: &Arc<Transaction>, record: RedoRecord, log_id: u64) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(StrataError::Internal("log sync service is closed".into()));
        }
        let waiter = Arc::new(CommitNotifier::new());
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.lock().push(SyncTask {
            tx: Arc::clone(tx),
            record,
            log_id,
            waiter: Some(Arc::clone(&waiter)),
        });
        if self.shared.interval.is_none() {
            self.shared.wake.notify_one();
        }
        waiter.wait()
    }

    fn async_write(&self, tx: &Arc<Transaction>, record: RedoRecord, log_id: u64) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            tx.async_commit_failed(StrataError::Internal("log sync service is closed".into()));
            return;
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.lock().push(SyncTask {
            tx: Arc::clone(tx),
            record,
            log_id,
            waiter: None,
        });
        if self.shared.interval.is_none() {
            self.shared.wake.notify_one();
        }
    }

    fn redo_log(&self) -> Option<&RedoLog> {
        Some(&self.shared.redo)
    }

    fn close(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.shared.redo.close();
    }
}

fn run(shared: Arc<SyncShared>) {
    loop {
        let batch: Vec<SyncTask> = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                match shared.interval {
                    // Periodic: sleep a full tick; arrivals wait for it.
                    Some(interval) => {
                        let _ = shared.wake.wait_for(&mut queue, interval);
                    }
                    None => {
                        while queue.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                            shared.wake.wait(&mut queue);
                        }
                    }
                }
            }
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            continue;
        }
        flush_batch(&shared, batch);
    }
}

fn flush_batch(shared: &SyncShared, batch: Vec<SyncTask>) {
    let mut staged = Vec::with_capacity(batch.len());
    for SyncTask {
        tx,
        record,
        log_id,
        waiter,
    } in batch
    {
        let write_err = record.write_to(&shared.redo).err();
        staged.push((tx, log_id, waiter, write_err));
    }
    let sync_err: Option<String> = shared.redo.sync().err().map(|err| err.to_string());

    for (tx, log_id, waiter, write_err) in staged {
        let outcome: Result<()> = match (write_err, &sync_err) {
            (Some(err), _) => Err(err),
            (None, Some(msg)) => Err(StrataError::Internal(format!("redo sync failed: {msg}"))),
            (None, None) => Ok(()),
        };
        match outcome {
            Ok(()) => {
                tx.on_synced();
                trace!(log_id, tx = tx.name(), "redo record durable");
                match waiter {
                    Some(waiter) => waiter.complete(Ok(())),
                    None => tx.async_commit_complete(),
                }
            }
            Err(err) => {
                warn!(log_id, tx = tx.name(), error = %err, "redo write failed");
                match waiter {
                    Some(waiter) => waiter.complete(Err(err)),
                    None => tx.async_commit_failed(err),
                }
            }
        }
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// No redo log: commits are durable only through explicit saves.
/// Suited to scratch stores and tests.
pub struct DisabledSync;

impl DisabledSync {
    fn absorb(record: RedoRecord) -> Result<()> {
        match record {
            RedoRecord::LobSave { task, record } => {
                task().map_err(|err| {
                    StrataError::Internal(format!("large-object save failed: {err}"))
                })?;
                Self::absorb(*record)
            }
            RedoRecord::Transaction(_) | RedoRecord::LazyTransaction(_) => Ok(()),
        }
    }
}

impl LogSyncService for DisabledSync {
    fn needs_sync(&self) -> bool {
        false
    }

    fn next_log_id(&self) -> u64 {
        0
    }

    fn sync_write(&self, tx: &Arc<Transaction>, record: RedoRecord, _log_id: u64) -> Result<()> {
        Self::absorb(record)?;
        tx.on_synced();
        Ok(())
    }

    fn async_write(&self, tx: &Arc<Transaction>, record: RedoRecord, log_id: u64) {
        match self.sync_write(tx, record, log_id) {
            Ok(()) => tx.async_commit_complete(),
            Err(err) => tx.async_commit_failed(err),
        }
    }

    fn redo_log(&self) -> Option<&RedoLog> {
        None
    }

    fn close(&self) {}
}
