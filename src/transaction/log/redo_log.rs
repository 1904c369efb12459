//! The redo log file.
//!
//! Append-only frames, each `[len][crc][kind][payload]` with the CRC
//! covering kind and payload. Opening scans the whole file, stops at
//! the first torn or corrupt frame (truncating the tail away), and
//! groups the surviving write sets per store so the engine can replay
//! them when each store is wired. A checkpoint truncates the file back
//! to its header once every store has saved.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::storage::btree::BTreeStore;
use crate::transaction::log::record::{decode_writes, ReplayWrite};
use crate::transaction::version::RowVersion;
use crate::types::{Result, StrataError, TxId};

const REDO_MAGIC: [u8; 4] = *b"STRL";
const REDO_VERSION: u16 = 1;
const HEADER_LEN: u64 = 20;
const FRAME_HEADER_LEN: usize = 9;

const KIND_TRANSACTION: u8 = 1;

/// Append-only redo log with per-store pending replay sets.
pub struct RedoLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: File,
    pending: HashMap<String, Vec<PendingWrite>>,
}

pub(crate) struct PendingWrite {
    pub key: Bytes,
    pub payload: Option<Bytes>,
}

impl RedoLog {
    /// Opens (creating if needed) the log and scans surviving records.
    pub fn open(path: &Path) -> Result<RedoLog> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut pending: HashMap<String, Vec<PendingWrite>> = HashMap::new();
        if len < HEADER_LEN {
            write_header(&mut file)?;
        } else {
            let buf = std::fs::read(path)?;
            validate_header(&buf)?;
            let good = scan_records(&buf, &mut pending);
            if good < buf.len() as u64 {
                warn!(
                    dropped = buf.len() as u64 - good,
                    "truncating torn redo log tail"
                );
                file.set_len(good)?;
                file.sync_all()?;
            }
            file.seek(SeekFrom::End(0))?;
        }

        if !pending.is_empty() {
            info!(
                maps = pending.len(),
                writes = pending.values().map(Vec::len).sum::<usize>(),
                "redo log holds unreplayed commits"
            );
        }
        Ok(RedoLog {
            path: path.to_path_buf(),
            inner: Mutex::new(LogInner { file, pending }),
        })
    }

    /// Appends one framed transaction record. Durable only after
    /// [`RedoLog::sync`].
    pub fn append_transaction(&self, body: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[KIND_TRANSACTION]);
        hasher.update(body);
        framed.extend_from_slice(&hasher.finalize().to_be_bytes());
        framed.push(KIND_TRANSACTION);
        framed.extend_from_slice(body);

        let mut inner = self.inner.lock();
        inner.file.write_all(&framed)?;
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Store names with writes awaiting replay.
    pub fn pending_map_names(&self) -> Vec<String> {
        self.inner.lock().pending.keys().cloned().collect()
    }

    /// Applies this store's pending writes as committed base versions,
    /// minting a fresh commit timestamp per write so replayed history
    /// stays below every future transaction. Returns the write count.
    pub(crate) fn replay_into(
        &self,
        store: &BTreeStore,
        mut next_ts: impl FnMut() -> TxId,
    ) -> Result<usize> {
        let writes = {
            self.inner
                .lock()
                .pending
                .remove(store.name())
                .unwrap_or_default()
        };
        let count = writes.len();
        for write in writes {
            match write.payload {
                Some(value) => {
                    store.put_head(write.key, RowVersion::committed_base(next_ts(), Some(value)));
                }
                None => {
                    store.remove_head(&write.key);
                }
            }
        }
        if count > 0 {
            debug!(store = store.name(), writes = count, "replayed redo writes");
        }
        Ok(count)
    }

    /// Current file length, for checkpoint race detection.
    pub fn log_len(&self) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.file.metadata()?.len())
    }

    /// Truncates the log back to a bare header. Callers must have
    /// saved every store first; records removed here are
    /// unrecoverable. When `expected_len` is given and the file has
    /// grown past it (commits landed after the save), truncation is
    /// skipped and false returned.
    pub fn checkpoint(&self, expected_len: Option<u64>) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.pending.is_empty() {
            return Err(StrataError::Internal(
                "checkpoint with unreplayed redo records".to_string(),
            ));
        }
        if let Some(expected) = expected_len {
            if inner.file.metadata()?.len() != expected {
                debug!("checkpoint truncation skipped; redo log advanced during save");
                return Ok(false);
            }
        }
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        write_header(&mut inner.file)?;
        debug!(path = %self.path.display(), "redo log truncated at checkpoint");
        Ok(true)
    }

    /// Flushes and closes.
    pub fn close(&self) {
        if let Err(err) = self.sync() {
            warn!(error = %err, "redo log final sync failed");
        }
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    header.extend_from_slice(&REDO_MAGIC);
    header.extend_from_slice(&REDO_VERSION.to_be_bytes());
    header.extend_from_slice(&[0u8; 2]);
    header.extend_from_slice(&rand::random::<u64>().to_be_bytes());
    header.extend_from_slice(&crc32fast::hash(&header).to_be_bytes());
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(())
}

fn validate_header(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_LEN as usize {
        return Err(StrataError::Corruption("redo log shorter than header"));
    }
    if buf[0..4] != REDO_MAGIC {
        return Err(StrataError::Corruption("bad redo log magic"));
    }
    let stored = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
    if crc32fast::hash(&buf[..16]) != stored {
        return Err(StrataError::Corruption("redo log header checksum mismatch"));
    }
    if u16::from_be_bytes([buf[4], buf[5]]) != REDO_VERSION {
        return Err(StrataError::Corruption("unsupported redo log version"));
    }
    Ok(())
}

/// Walks frames from the header on, filling `pending`. Returns the
/// offset of the first bad frame (== buffer length when all is well).
fn scan_records(buf: &[u8], pending: &mut HashMap<String, Vec<PendingWrite>>) -> u64 {
    let mut at = HEADER_LEN as usize;
    while at < buf.len() {
        if at + FRAME_HEADER_LEN > buf.len() {
            return at as u64;
        }
        let body_len =
            u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
        let stored_crc = u32::from_be_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
        let frame_end = at + FRAME_HEADER_LEN + body_len;
        if frame_end > buf.len() {
            return at as u64;
        }
        let kind = buf[at + 8];
        let body = &buf[at + FRAME_HEADER_LEN..frame_end];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[kind]);
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return at as u64;
        }
        if kind == KIND_TRANSACTION {
            match decode_writes(body) {
                Ok(writes) => {
                    for ReplayWrite { map, key, payload } in writes {
                        pending
                            .entry(map)
                            .or_default()
                            .push(PendingWrite { key, payload });
                    }
                }
                Err(_) => return at as u64,
            }
        }
        // Unknown kinds passed the CRC: written by a newer version,
        // skip them.
        at = frame_end;
    }
    at as u64
}
