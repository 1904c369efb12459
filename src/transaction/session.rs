//! Session hooks for cooperative lock waiting.
//!
//! The engine never blocks a thread on a row lock. When a write hits a
//! row owned by another transaction, the requester's session is handed
//! to the holder, which flips the session into a waiting state and
//! registers its [`TransactionListener`]. The holder wakes every
//! registered listener when it finalizes, and the waiter retries. How a
//! waiter spends the in-between time is the session's business:
//! [`ParkingListener`] parks the thread, a scheduler-driven session
//! could requeue the statement instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::types::TxId;

/// Where a session currently stands, for diagnostics and scheduler
/// cooperation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    /// No statement in flight.
    Idle,
    /// Executing a statement.
    Running,
    /// Parked behind another transaction's row lock.
    Waiting,
    /// Told to retry after a holder finalized.
    Retrying,
}

/// Wake-up channel a lock holder uses to notify a parked waiter.
pub trait TransactionListener: Send + Sync {
    /// Called by the holder (on the holder's thread) once the lock is
    /// released.
    fn wake_up(&self);

    /// Parks until [`TransactionListener::wake_up`]. The default yields
    /// instead of parking, which suits polling callers.
    fn await_wake(&self) {
        std::thread::yield_now();
    }
}

/// What a transaction needs from the session that drives it.
pub trait Session: Send + Sync {
    /// Listener the holder will wake when it releases its locks.
    fn transaction_listener(&self) -> Arc<dyn TransactionListener>;

    /// Current status.
    fn status(&self) -> SessionStatus;

    /// Records (or clears) who this session is waiting on. Called by
    /// the lock holder while registering the wait, and again to undo it
    /// when registration loses the race with the holder's finalize.
    fn set_lock_wait(&self, status: SessionStatus, holder: Option<TxId>, key: Option<&[u8]>);

    /// Post-finalize bookkeeping hook.
    fn on_finalized(&self, _committed: bool) {}
}

/// Flag-plus-condvar listener: wake-ups before the park are never lost.
#[derive(Default)]
pub struct ParkingListener {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl ParkingListener {
    /// Fresh listener in the unwoken state.
    pub fn new() -> ParkingListener {
        ParkingListener::default()
    }

    /// Parks for at most `timeout`; true when woken, false on timeout.
    pub fn await_wake_for(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.condvar.wait_for(&mut woken, timeout);
        }
        let was = *woken;
        *woken = false;
        was
    }
}

impl TransactionListener for ParkingListener {
    fn wake_up(&self) {
        *self.woken.lock() = true;
        self.condvar.notify_all();
    }

    fn await_wake(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.condvar.wait(&mut woken);
        }
        *woken = false;
    }
}

/// Thread-backed session for embedded use and tests.
pub struct LocalSession {
    listener: Arc<ParkingListener>,
    wait_state: Mutex<WaitState>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

#[derive(Default)]
struct WaitState {
    status: Option<SessionStatus>,
    holder: Option<TxId>,
    key: Option<Bytes>,
}

impl LocalSession {
    /// New idle session.
    pub fn new() -> Arc<LocalSession> {
        Arc::new(LocalSession {
            listener: Arc::new(ParkingListener::new()),
            wait_state: Mutex::new(WaitState::default()),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        })
    }

    /// Transaction currently holding the row this session waits on.
    pub fn blocked_by(&self) -> Option<TxId> {
        self.wait_state.lock().holder
    }

    /// Key this session waits on, for diagnostics.
    pub fn waiting_on_key(&self) -> Option<Bytes> {
        self.wait_state.lock().key.clone()
    }

    /// Commits finalized under this session.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Rollbacks finished under this session.
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

impl Session for LocalSession {
    fn transaction_listener(&self) -> Arc<dyn TransactionListener> {
        Arc::clone(&self.listener) as Arc<dyn TransactionListener>
    }

    fn status(&self) -> SessionStatus {
        self.wait_state.lock().status.unwrap_or(SessionStatus::Idle)
    }

    fn set_lock_wait(&self, status: SessionStatus, holder: Option<TxId>, key: Option<&[u8]>) {
        let mut state = self.wait_state.lock();
        state.status = Some(status);
        state.holder = holder;
        state.key = key.map(Bytes::copy_from_slice);
    }

    fn on_finalized(&self, committed: bool) {
        if committed {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
