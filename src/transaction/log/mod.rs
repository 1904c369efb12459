//! Redo logging and durability scheduling.

pub mod record;
pub mod redo_log;
pub mod sync;

pub use record::{LobTask, RedoRecord};
pub use redo_log::RedoLog;
pub use sync::{DisabledSync, GroupCommitSync, LogSyncService};
