//! MVCC transaction engine: version chains, undo logging, redo
//! durability, and cooperative row locking.

pub mod engine;
pub mod log;
pub mod map;
pub mod session;
pub mod tx;
pub mod undo;
pub mod version;

pub use engine::TransactionEngine;
pub use map::{TransactionMap, WriteOutcome};
pub use session::{LocalSession, ParkingListener, Session, SessionStatus, TransactionListener};
pub use tx::{Transaction, WaitOutcome};
pub use version::RowVersion;

/// Read visibility rules a transaction runs under.
///
/// `Serializable` shares `RepeatableRead`'s snapshot visibility; the
/// conflict checks that distinguish them live above this engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IsolationLevel {
    /// Newest version wins, committed or not.
    ReadUncommitted,
    /// Newest committed version wins.
    ReadCommitted,
    /// Newest version committed before the viewer began wins.
    RepeatableRead,
    /// Snapshot reads as in `RepeatableRead`.
    Serializable,
}
