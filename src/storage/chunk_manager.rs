//! Chunk bookkeeping for one store directory.
//!
//! The manager tracks which chunk files exist, lazily materializes their
//! page-position indexes, resolves page reads, and owns the removed-page
//! set that records which persisted pages are no longer referenced by
//! the current tree. The removed set is persisted to a sidecar file so
//! garbage accounting survives restarts.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::chunk::{self, Chunk};
use crate::types::{ChunkId, PagePos, Result, StrataError};

const REMOVED_FILE: &str = "removed.bin";
const REMOVED_MAGIC: [u8; 4] = *b"STRM";
const REMOVED_VERSION: u16 = 1;

/// Tracks chunk files and removed pages for one store directory.
pub struct ChunkManager {
    dir: PathBuf,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    /// Every chunk id with a file on disk.
    known: BTreeSet<ChunkId>,
    /// Chunks whose trailers have been read.
    resident: HashMap<ChunkId, Chunk>,
    /// Persisted pages no longer referenced by the current tree.
    removed: BTreeSet<PagePos>,
    next_id: u32,
}

impl ChunkManager {
    /// Opens (creating if needed) a store directory and scans it for
    /// chunk files and the persisted removed-page set.
    pub fn open(dir: &Path) -> Result<ChunkManager> {
        fs::create_dir_all(dir)?;
        let mut known = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(id) = parse_chunk_file_name(&entry.file_name().to_string_lossy()) {
                known.insert(id);
            }
        }
        let next_id = known.iter().next_back().map_or(0, |id| id.0 + 1);
        let mut removed = load_removed(&dir.join(REMOVED_FILE))?;
        // Entries pointing into chunks that no longer exist carry no
        // information; drop them up front.
        removed.retain(|pos| known.contains(&pos.chunk_id()));

        Ok(ChunkManager {
            dir: dir.to_path_buf(),
            state: Mutex::new(ManagerState {
                known,
                resident: HashMap::new(),
                removed,
                next_id,
            }),
        })
    }

    /// Store directory this manager owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Chunk ids on disk, newest first.
    pub fn known_ids_desc(&self) -> Vec<ChunkId> {
        self.state.lock().known.iter().rev().copied().collect()
    }

    /// True when at least one chunk file exists.
    pub fn has_chunks(&self) -> bool {
        !self.state.lock().known.is_empty()
    }

    /// Number of chunk files on disk.
    pub fn chunk_count(&self) -> usize {
        self.state.lock().known.len()
    }

    /// True when the id names an existing chunk.
    pub fn contains_chunk(&self, id: ChunkId) -> bool {
        self.state.lock().known.contains(&id)
    }

    /// Reserves the next chunk id. The id becomes known once the chunk
    /// is installed.
    pub fn allocate_chunk_id(&self) -> ChunkId {
        let mut state = self.state.lock();
        let id = ChunkId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Registers a freshly written chunk.
    pub fn install_chunk(&self, chunk: Chunk) {
        let mut state = self.state.lock();
        state.known.insert(chunk.id);
        state.resident.insert(chunk.id, chunk);
    }

    /// Ensures the chunk's trailer has been read into memory.
    pub fn materialize(&self, id: ChunkId) -> Result<()> {
        {
            let state = self.state.lock();
            if !state.known.contains(&id) {
                return Err(StrataError::Corruption("page position names unknown chunk"));
            }
            if state.resident.contains_key(&id) {
                return Ok(());
            }
        }
        let chunk = chunk::read_chunk_meta(&self.dir, id)?;
        self.state.lock().resident.insert(id, chunk);
        Ok(())
    }

    /// Materializes every known chunk.
    pub fn materialize_all(&self) -> Result<()> {
        for id in self.known_ids_desc() {
            self.materialize(id)?;
        }
        Ok(())
    }

    /// Clones of all resident chunk descriptions.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.state.lock().resident.values().cloned().collect()
    }

    /// Root position and max commit timestamp of a resident chunk.
    pub fn chunk_meta(&self, id: ChunkId) -> Option<(PagePos, u64)> {
        self.state
            .lock()
            .resident
            .get(&id)
            .map(|c| (c.root_pos, c.max_commit_ts))
    }

    /// Deletes a chunk file that failed validation, typically the torn
    /// product of a crashed save.
    pub fn discard_chunk_file(&self, id: ChunkId) -> Result<()> {
        warn!(chunk = %id, "discarding invalid chunk file");
        fs::remove_file(self.dir.join(id.file_name()))?;
        let mut state = self.state.lock();
        state.known.remove(&id);
        state.resident.remove(&id);
        Ok(())
    }

    /// Deletes a chunk whose pages are all garbage and forgets it.
    /// Returns the positions the chunk held so callers can shrink their
    /// own views of the removed set.
    pub fn remove_unused_chunk(&self, id: ChunkId) -> Result<Vec<PagePos>> {
        self.materialize(id)?;
        let positions: Vec<PagePos> = {
            let state = self.state.lock();
            match state.resident.get(&id) {
                Some(chunk) => chunk.page_lengths.keys().copied().collect(),
                None => return Err(StrataError::Corruption("page position names unknown chunk")),
            }
        };
        fs::remove_file(self.dir.join(id.file_name()))?;
        let mut state = self.state.lock();
        state.known.remove(&id);
        state.resident.remove(&id);
        for pos in &positions {
            state.removed.remove(pos);
        }
        debug!(chunk = %id, pages = positions.len(), "removed fully garbage chunk");
        Ok(positions)
    }

    /// Encoded length of the page at `pos`, materializing its chunk if
    /// needed. Positions absent from their chunk's index are corruption.
    pub fn page_length(&self, pos: PagePos) -> Result<u32> {
        self.materialize(pos.chunk_id())?;
        let state = self.state.lock();
        state
            .resident
            .get(&pos.chunk_id())
            .and_then(|chunk| chunk.page_lengths.get(&pos).copied())
            .ok_or(StrataError::Corruption("page position not in chunk index"))
    }

    /// Reads the raw encoded bytes of one page.
    pub fn read_page(&self, pos: PagePos) -> Result<Vec<u8>> {
        let len = self.page_length(pos)?;
        chunk::read_page_bytes(&self.dir, pos, len)
    }

    /// Snapshot of the removed-page set.
    pub fn removed_snapshot(&self) -> BTreeSet<PagePos> {
        self.state.lock().removed.clone()
    }

    /// Number of tracked removed pages.
    pub fn removed_count(&self) -> usize {
        self.state.lock().removed.len()
    }

    /// Records pages superseded by a save. In-memory only; call
    /// [`ChunkManager::persist_removed_pages`] to make it durable.
    pub fn add_removed_pages<I: IntoIterator<Item = PagePos>>(&self, positions: I) {
        let mut state = self.state.lock();
        state.removed.extend(positions);
    }

    /// Writes the removed-page set to its sidecar file via a temp file
    /// and rename, so a crash leaves either the old or the new set.
    pub fn persist_removed_pages(&self) -> Result<()> {
        let snapshot = self.removed_snapshot();
        let mut buf = Vec::with_capacity(16 + snapshot.len() * 8);
        buf.extend_from_slice(&REMOVED_MAGIC);
        buf.extend_from_slice(&REMOVED_VERSION.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&(snapshot.len() as u32).to_be_bytes());
        for pos in &snapshot {
            buf.extend_from_slice(&pos.raw().to_be_bytes());
        }
        buf.extend_from_slice(&crc32fast::hash(&buf).to_be_bytes());

        let tmp = self.dir.join(format!("{REMOVED_FILE}.tmp"));
        let target = self.dir.join(REMOVED_FILE);
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}

fn parse_chunk_file_name(name: &str) -> Option<ChunkId> {
    let digits = name.strip_prefix("c_")?.strip_suffix(".chunk")?;
    digits.parse::<u32>().ok().map(ChunkId)
}

fn load_removed(path: &Path) -> Result<BTreeSet<PagePos>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err.into()),
    };
    if buf.len() < 16 {
        return Err(StrataError::Corruption("removed-page file truncated"));
    }
    if buf[0..4] != REMOVED_MAGIC {
        return Err(StrataError::Corruption("bad removed-page file magic"));
    }
    if u16::from_be_bytes([buf[4], buf[5]]) != REMOVED_VERSION {
        return Err(StrataError::Corruption("unsupported removed-page file version"));
    }
    let body_len = buf.len() - 4;
    let stored = u32::from_be_bytes([buf[body_len], buf[body_len + 1], buf[body_len + 2], buf[body_len + 3]]);
    if crc32fast::hash(&buf[..body_len]) != stored {
        return Err(StrataError::Corruption("removed-page file checksum mismatch"));
    }
    let count = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if body_len != 12 + count * 8 {
        return Err(StrataError::Corruption("removed-page file length mismatch"));
    }
    let mut removed = BTreeSet::new();
    for i in 0..count {
        let at = 12 + i * 8;
        let raw = u64::from_be_bytes(
            buf[at..at + 8]
                .try_into()
                .map_err(|_| StrataError::Corruption("removed-page file truncated"))?,
        );
        removed.insert(PagePos::from_raw(raw));
    }
    Ok(removed)
}
