//! Redo record shapes and the write-set wire format.
//!
//! A committing transaction's writes travel to the redo log either
//! pre-encoded (`Transaction`) or as a handle encoded on the sync
//! thread right before the flush (`LazyTransaction`, used by periodic
//! sync so the committer does no encoding work). `LobSave` brackets a
//! record with a side task that must become durable first, such as a
//! large-object file write.

use std::sync::Arc;

use bytes::Bytes;

use crate::transaction::log::redo_log::RedoLog;
use crate::transaction::tx::Transaction;
use crate::transaction::undo::UndoLog;
use crate::types::{Result, StrataError};

/// Side task staged to run just before its transaction's redo record
/// is written.
pub type LobTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// One queued redo write.
pub enum RedoRecord {
    /// Write set already encoded by the committing thread.
    Transaction(Bytes),
    /// Write set encoded at flush time from the live transaction.
    LazyTransaction(Arc<Transaction>),
    /// Runs `task`, then writes the wrapped record.
    LobSave {
        /// Must succeed before the record may be logged.
        task: LobTask,
        /// The record the task guards.
        record: Box<RedoRecord>,
    },
}

impl RedoRecord {
    /// Appends this record to the log (no fsync). Consumes the record;
    /// lazy encodings happen here, on the sync thread.
    pub(crate) fn write_to(self, log: &RedoLog) -> Result<()> {
        match self {
            RedoRecord::Transaction(body) => log.append_transaction(&body),
            RedoRecord::LazyTransaction(tx) => {
                let body = tx.encode_writes()?;
                log.append_transaction(&body)
            }
            RedoRecord::LobSave { task, record } => {
                task().map_err(|err| {
                    StrataError::Internal(format!("large-object save failed: {err}"))
                })?;
                record.write_to(log)
            }
        }
    }
}

/// One write replayed from the log: `None` payload means delete.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplayWrite {
    /// Store the write belongs to.
    pub map: String,
    /// Row key.
    pub key: Bytes,
    /// Row payload, `None` for deletes.
    pub payload: Option<Bytes>,
}

/// Encodes a transaction's write set for the redo log.
pub(crate) fn encode_writes(undo: &UndoLog) -> Bytes {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(undo.len() as u32).to_be_bytes());
    for entry in undo.entries() {
        let name = entry.map_name().as_bytes();
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&(entry.key().len() as u32).to_be_bytes());
        buf.extend_from_slice(entry.key());
        match entry.new_payload() {
            Some(value) => {
                buf.push(1);
                buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
                buf.extend_from_slice(value);
            }
            None => buf.push(0),
        }
    }
    Bytes::from(buf)
}

/// Decodes a record body back into its writes, in original order.
pub(crate) fn decode_writes(body: &[u8]) -> Result<Vec<ReplayWrite>> {
    let mut at = 0usize;
    let take = |at: &mut usize, n: usize| -> Result<&[u8]> {
        if *at + n > body.len() {
            return Err(StrataError::Corruption("redo record body truncated"));
        }
        let out = &body[*at..*at + n];
        *at += n;
        Ok(out)
    };

    let count = {
        let b = take(&mut at, 4)?;
        u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
    };
    let mut writes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = {
            let b = take(&mut at, 2)?;
            u16::from_be_bytes([b[0], b[1]]) as usize
        };
        let map = std::str::from_utf8(take(&mut at, name_len)?)
            .map_err(|_| StrataError::Corruption("redo record map name not utf-8"))?
            .to_string();
        let key_len = {
            let b = take(&mut at, 4)?;
            u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
        };
        let key = Bytes::copy_from_slice(take(&mut at, key_len)?);
        let tag = take(&mut at, 1)?[0];
        let payload = match tag {
            0 => None,
            1 => {
                let len = {
                    let b = take(&mut at, 4)?;
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
                };
                Some(Bytes::copy_from_slice(take(&mut at, len)?))
            }
            _ => return Err(StrataError::Corruption("redo record bad payload tag")),
        };
        writes.push(ReplayWrite { map, key, payload });
    }
    if at != body.len() {
        return Err(StrataError::Corruption("redo record trailing bytes"));
    }
    Ok(writes)
}
