//! The transaction engine: id minting, the active-transaction
//! registry, redo durability wiring, and commit finalization.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{StorageConfig, SyncMode};
use crate::storage::maintenance::MaintenanceWorker;
use crate::storage::{BTreeStore, Storage};
use crate::transaction::log::{DisabledSync, GroupCommitSync, LogSyncService};
use crate::transaction::tx::Transaction;
use crate::transaction::IsolationLevel;
use crate::types::{Result, StrataError, TxId};

/// Engine-wide transaction state. One per database directory.
///
/// Holds the single counter that issues both transaction ids and
/// commit timestamps, so a version's commit timestamp always compares
/// against reader ids on one axis. The engine must be closed
/// explicitly (or dropped) to stop its background threads; open
/// transactions keep it alive through their back-references.
pub struct TransactionEngine {
    /// Back-reference to the owning `Arc`, so transactions can carry a
    /// strong engine handle without the engine exposing one.
    me: Weak<TransactionEngine>,
    config: StorageConfig,
    counter: AtomicU64,
    registry: Mutex<HashMap<TxId, Arc<Transaction>>>,
    stores: Mutex<HashMap<String, Arc<BTreeStore>>>,
    service: Arc<dyn LogSyncService>,
    maintenance: Mutex<Option<MaintenanceWorker>>,
    closed: AtomicBool,
}

impl TransactionEngine {
    /// Opens the engine over a storage root, starting the log sync
    /// service named by the config and the maintenance worker.
    ///
    /// Every map already on disk (and every map with recovered redo
    /// records) is wired immediately, so the id counter starts above
    /// all persisted history before the first transaction begins.
    pub fn open(storage: &Storage, config: StorageConfig) -> Result<Arc<TransactionEngine>> {
        let dir = storage.base_dir();
        let redo_path = dir.join("redo.log");
        let service: Arc<dyn LogSyncService> = match config.sync_mode {
            SyncMode::Instant => GroupCommitSync::start_instant(&redo_path)?,
            SyncMode::Periodic => {
                GroupCommitSync::start_periodic(&redo_path, config.sync_interval)?
            }
            SyncMode::Disabled => Arc::new(DisabledSync),
        };
        let engine = Arc::new_cyclic(|me| TransactionEngine {
            me: me.clone(),
            counter: AtomicU64::new(0),
            registry: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            service,
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });
        let mut names = persisted_map_names(dir)?;
        if let Some(redo) = engine.service.redo_log() {
            names.extend(redo.pending_map_names());
        }
        for name in &names {
            let store = storage.open_map(name)?;
            engine.wire_store(&store)?;
        }
        let worker = MaintenanceWorker::spawn(
            Arc::downgrade(&engine),
            engine.config.maintenance_interval,
            engine.config.compact_threshold,
        );
        *engine.maintenance.lock() = Some(worker);
        info!(
            dir = %dir.display(),
            sync = ?engine.config.sync_mode,
            maps = names.len(),
            "transaction engine opened"
        );
        Ok(engine)
    }

    /// Starts a read-committed, manually committed transaction.
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.begin_with(IsolationLevel::ReadCommitted, false)
    }

    /// Starts a transaction with an explicit isolation level.
    pub fn begin_with(
        &self,
        isolation: IsolationLevel,
        auto_commit: bool,
    ) -> Result<Arc<Transaction>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StrataError::Invalid("transaction engine is closed"));
        }
        let engine = self
            .me
            .upgrade()
            .ok_or(StrataError::Invalid("transaction engine is closed"))?;
        let tid = self.next_transaction_id();
        let name = format!("{}:{}", self.config.host_and_port, tid);
        let tx = Arc::new(Transaction::new(engine, tid, name, isolation, auto_commit));
        self.registry.lock().insert(tid, Arc::clone(&tx));
        debug!(tid, ?isolation, "transaction started");
        Ok(tx)
    }

    /// Issues the next id. Shared by transaction starts and commit
    /// timestamps.
    pub fn next_transaction_id(&self) -> TxId {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raises the counter to at least `ts`. Called with persisted
    /// maxima so ids never repeat across restarts.
    pub fn observe_timestamp(&self, ts: TxId) {
        self.counter.fetch_max(ts, Ordering::AcqRel);
    }

    /// Looks up an open transaction by id.
    pub fn find_transaction(&self, tid: TxId) -> Option<Arc<Transaction>> {
        self.registry.lock().get(&tid).cloned()
    }

    pub(crate) fn remove_transaction(&self, tid: TxId) -> bool {
        self.registry.lock().remove(&tid).is_some()
    }

    /// Number of currently open transactions.
    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Oldest open transaction id, or one past the counter when the
    /// registry is empty. Versions at or below this are visible to
    /// every current and future reader, so older history is prunable.
    pub fn watermark(&self) -> TxId {
        let registry = self.registry.lock();
        match registry.keys().min() {
            Some(&tid) => tid,
            None => self.counter.load(Ordering::Acquire) + 1,
        }
    }

    /// Finalizes a committed transaction: removes it from the
    /// registry, stamps its versions with the commit timestamp, prunes
    /// history under the watermark, marks pages dirty, and wakes
    /// waiters. Returns false when another caller already finalized
    /// it; the registry removal is the tiebreaker, so the rest runs
    /// exactly once.
    pub fn commit_final(&self, tid: TxId) -> bool {
        let tx = match self.registry.lock().remove(&tid) {
            Some(tx) => tx,
            None => return false,
        };
        let state = tx.take_finalize_state();
        let ts = tx.commit_ts();
        let watermark = self.watermark();
        if let Some(undo) = state.undo {
            undo.finalize_commit(ts, watermark);
        }
        if let Some(session) = state.session {
            session.on_finalized(true);
        }
        tx.wake_waiters();
        debug!(tid, commit_ts = ts, "transaction committed");
        true
    }

    /// Returns the store for `name`, wiring it into the engine on
    /// first use: the persisted timestamp maximum feeds the counter
    /// and recovered redo records replay into the map.
    pub fn open_store(&self, storage: &Storage, name: &str) -> Result<Arc<BTreeStore>> {
        if let Some(store) = self.stores.lock().get(name) {
            return Ok(Arc::clone(store));
        }
        let store = storage.open_map(name)?;
        self.wire_store(&store)?;
        Ok(store)
    }

    fn wire_store(&self, store: &Arc<BTreeStore>) -> Result<()> {
        let mut stores = self.stores.lock();
        if stores.contains_key(store.name()) {
            return Ok(());
        }
        self.observe_timestamp(store.max_saved_ts());
        if let Some(redo) = self.service.redo_log() {
            redo.replay_into(store, || self.next_transaction_id())?;
        }
        stores.insert(store.name().to_string(), Arc::clone(store));
        Ok(())
    }

    /// Every store wired into the engine so far.
    pub fn stores(&self) -> Vec<Arc<BTreeStore>> {
        self.stores.lock().values().cloned().collect()
    }

    /// Persists committed data and resets the redo log. Truncation is
    /// skipped when commits land during the save; those records wait
    /// for the next checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        // Let in-flight commits reach their timestamps so the save
        // below captures them.
        let mut tries = 0;
        while self.service.in_flight() > 0 && tries < 1000 {
            std::thread::sleep(Duration::from_millis(1));
            tries += 1;
        }
        let pre_len = match self.service.redo_log() {
            Some(redo) => Some(redo.log_len()?),
            None => None,
        };
        let mut saved = 0usize;
        for store in self.stores() {
            if store.save()? {
                saved += 1;
            }
        }
        let mut truncated = false;
        if let Some(redo) = self.service.redo_log() {
            truncated = redo.checkpoint(pre_len)?;
        }
        info!(maps_saved = saved, truncated, "checkpoint complete");
        Ok(())
    }

    /// Asks the maintenance worker for an immediate compaction pass.
    pub fn trigger_compaction(&self) {
        if let Some(worker) = self.maintenance.lock().as_ref() {
            worker.trigger();
        }
    }

    pub(crate) fn log_service(&self) -> &Arc<dyn LogSyncService> {
        &self.service
    }

    /// Stops background threads, reverts transactions left open, and
    /// flushes the log sync service. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.maintenance.lock().take() {
            worker.shutdown();
        }
        let open: Vec<Arc<Transaction>> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(_, tx)| tx).collect()
        };
        for tx in &open {
            tx.wake_waiters();
        }
        // Handles the engine held were the last for any abandoned
        // transaction; dropping them reverts leftover writes.
        drop(open);
        self.service.close();
        info!("transaction engine closed");
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subdirectories of the storage root that look like map stores.
fn persisted_map_names(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if crate::storage::validate_map_name(name).is_ok() {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}
