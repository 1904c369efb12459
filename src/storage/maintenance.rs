//! Background maintenance worker.
//!
//! One thread per engine wakes on an interval (or an explicit trigger),
//! compacts stores whose removed-page count crossed the configured
//! threshold, and evicts version-chain garbage no active transaction
//! can still see.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::transaction::engine::TransactionEngine;

pub(crate) enum MaintenanceMessage {
    Trigger,
    Shutdown,
}

/// Handle to the maintenance thread.
pub struct MaintenanceWorker {
    sender: mpsc::Sender<MaintenanceMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Spawns the worker. With `interval` set it also runs on a timer;
    /// otherwise only explicit triggers do work.
    pub(crate) fn spawn(
        engine: Weak<TransactionEngine>,
        interval: Option<Duration>,
        compact_threshold: usize,
    ) -> MaintenanceWorker {
        let (sender, receiver) = mpsc::channel();
        let handle = std::thread::spawn(move || loop {
            let message = match interval {
                Some(interval) => match receiver.recv_timeout(interval) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };
            if matches!(message, Some(MaintenanceMessage::Shutdown)) {
                break;
            }
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let forced = matches!(message, Some(MaintenanceMessage::Trigger));
            run_pass(&engine, forced, compact_threshold);
        });
        MaintenanceWorker {
            sender,
            handle: Some(handle),
        }
    }

    /// Asks the worker to run a pass now, regardless of thresholds.
    pub fn trigger(&self) {
        let _ = self.sender.send(MaintenanceMessage::Trigger);
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(MaintenanceMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_pass(engine: &TransactionEngine, forced: bool, compact_threshold: usize) {
    let watermark = engine.watermark();
    for store in engine.stores() {
        let garbage = store.manager().removed_count();
        if forced || garbage >= compact_threshold {
            debug!(store = store.name(), garbage, forced, "maintenance compacting");
            if let Err(err) = store.compact() {
                warn!(store = store.name(), error = %err, "compaction failed");
            }
        }
        let evicted = store.evict_tombstones(watermark);
        if evicted > 0 {
            debug!(store = store.name(), evicted, "evicted dead tombstones");
        }
    }
}
