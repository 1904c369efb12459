//! Copy-on-write tree store.
//!
//! A [`BTreeStore`] keeps its working set in memory as a sorted map from
//! key to the head of a row version chain, partitioned into leaves.
//! Saving persists only committed rows: every dirty leaf is serialized
//! (splitting when oversized) and appended to a single new chunk,
//! followed by a fresh root page. Superseded page positions join the
//! removed-page set; nothing is ever overwritten in place. Opening a
//! store finds the newest chunk with a valid trailer and rebuilds the
//! tree from its root, which makes a crash mid-save invisible apart
//! from a torn chunk file that gets discarded.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::storage::chunk_manager::ChunkManager;
use crate::storage::chunk::ChunkWriter;
use crate::storage::compactor::ChunkCompactor;
use crate::storage::page::{
    encode_internal, encode_leaf, leaf_entry_encoded_len, ChildRef, LeafEntry, Page,
};
use crate::transaction::version::RowVersion;
use crate::types::{PageKind, PagePos, Result, StrataError, TxId};

/// One chunk-organized, multi-version key/value store.
pub struct BTreeStore {
    name: String,
    min_fill_rate: u8,
    max_compact_size: u64,
    page_split_size: usize,
    manager: ChunkManager,
    state: RwLock<TreeState>,
    save_lock: Mutex<()>,
    compact_lock: Mutex<()>,
}

struct TreeState {
    entries: BTreeMap<Bytes, Arc<RowVersion>>,
    leaves: Vec<LeafSlot>,
    root_pos: Option<PagePos>,
    max_saved_ts: TxId,
}

/// In-memory leaf bookkeeping. The first slot covers every key below
/// its `first_key` as well; `pos` is `None` until the leaf has persisted
/// committed rows.
#[derive(Clone)]
struct LeafSlot {
    first_key: Bytes,
    pos: Option<PagePos>,
    dirty: bool,
}

impl TreeState {
    fn leaf_index(&self, key: &[u8]) -> Option<usize> {
        if self.leaves.is_empty() {
            return None;
        }
        let idx = self
            .leaves
            .partition_point(|slot| slot.first_key.as_ref() <= key);
        Some(idx.saturating_sub(1))
    }

    fn mark_dirty_for(&mut self, key: &[u8]) {
        if let Some(idx) = self.leaf_index(key) {
            self.leaves[idx].dirty = true;
        }
    }

    fn ensure_leaf_for(&mut self, key: &Bytes) {
        if self.leaves.is_empty() {
            self.leaves.push(LeafSlot {
                first_key: key.clone(),
                pos: None,
                dirty: false,
            });
        } else if key.as_ref() < self.leaves[0].first_key.as_ref() {
            self.leaves[0].first_key = key.clone();
        }
    }
}

impl BTreeStore {
    /// Opens the store rooted at `dir`, rebuilding from the newest valid
    /// chunk if one exists.
    pub fn open(dir: &Path, name: &str, config: &StorageConfig) -> Result<BTreeStore> {
        let manager = ChunkManager::open(dir)?;
        let mut state = TreeState {
            entries: BTreeMap::new(),
            leaves: Vec::new(),
            root_pos: None,
            max_saved_ts: 0,
        };

        let mut current = None;
        for id in manager.known_ids_desc() {
            match manager.materialize(id) {
                Ok(()) => {
                    current = Some(id);
                    break;
                }
                Err(err) => {
                    // A crashed save leaves at most a torn newest chunk;
                    // everything referenced lives in older files.
                    warn!(store = name, chunk = %id, error = %err, "skipping torn chunk");
                    manager.discard_chunk_file(id)?;
                }
            }
        }

        if let Some(id) = current {
            let (root_pos, max_ts) = manager
                .chunk_meta(id)
                .ok_or(StrataError::Corruption("materialized chunk vanished"))?;
            let root = Page::decode(&manager.read_page(root_pos)?)?;
            let children = match root {
                Page::Internal(children) => children,
                Page::Leaf(_) => return Err(StrataError::Corruption("root page is not internal")),
            };
            for child in children {
                let leaf = Page::decode(&manager.read_page(child.pos)?)?;
                let rows = match leaf {
                    Page::Leaf(rows) => rows,
                    Page::Internal(_) => {
                        return Err(StrataError::Corruption("leaf position holds internal page"))
                    }
                };
                for row in rows {
                    state.entries.insert(
                        row.key,
                        RowVersion::committed_base(row.commit_ts, Some(row.value)),
                    );
                }
                state.leaves.push(LeafSlot {
                    first_key: child.first_key,
                    pos: Some(child.pos),
                    dirty: false,
                });
            }
            state.root_pos = Some(root_pos);
            state.max_saved_ts = max_ts;
            debug!(
                store = name,
                chunk = %id,
                rows = state.entries.len(),
                leaves = state.leaves.len(),
                "opened store"
            );
        }

        Ok(BTreeStore {
            name: name.to_string(),
            min_fill_rate: config.min_fill_rate,
            max_compact_size: config.max_compact_size,
            page_split_size: config.page_split_size,
            manager,
            state: RwLock::new(state),
            save_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chunk bookkeeping for this store.
    pub fn manager(&self) -> &ChunkManager {
        &self.manager
    }

    /// Fill-rate threshold below which compaction rewrites a chunk.
    pub fn min_fill_rate(&self) -> u8 {
        self.min_fill_rate
    }

    /// Byte cap per compaction pass.
    pub fn max_compact_size(&self) -> u64 {
        self.max_compact_size
    }

    /// Highest commit timestamp persisted so far.
    pub fn max_saved_ts(&self) -> TxId {
        self.state.read().max_saved_ts
    }

    /// Number of keys with a version chain in memory.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True when no key has a version chain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Head of the version chain for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Arc<RowVersion>> {
        self.state.read().entries.get(key).cloned()
    }

    /// Unconditionally installs a new chain head, returning the old one.
    /// Only committed heads dirty the owning leaf: an uncommitted
    /// install has nothing a save could persist, and its commit marks
    /// the leaf itself.
    pub fn put_head(&self, key: Bytes, head: Arc<RowVersion>) -> Option<Arc<RowVersion>> {
        let mut state = self.state.write();
        state.ensure_leaf_for(&key);
        if head.is_committed() {
            state.mark_dirty_for(&key);
        }
        state.entries.insert(key, head)
    }

    /// Swaps the chain head only if the current head is pointer-equal to
    /// `expected` (`None` means the key must be absent). This is the
    /// conflict gate every transactional write goes through.
    pub fn cas_head(
        &self,
        key: &Bytes,
        expected: Option<&Arc<RowVersion>>,
        new: Arc<RowVersion>,
    ) -> bool {
        let mut state = self.state.write();
        match (state.entries.get(key).cloned(), expected) {
            (None, None) => {
                state.ensure_leaf_for(key);
                if new.is_committed() {
                    state.mark_dirty_for(key);
                }
                state.entries.insert(key.clone(), new);
                true
            }
            (Some(current), Some(expected)) if Arc::ptr_eq(&current, expected) => {
                if new.is_committed() {
                    state.mark_dirty_for(key);
                }
                state.entries.insert(key.clone(), new);
                true
            }
            _ => false,
        }
    }

    /// Replaces the head only when it still is `expected`. Passing the
    /// same version as both arguments is the compaction "touch": a
    /// no-op write that dirties the owning leaf so the next save moves
    /// it into a fresh chunk.
    pub fn replace(&self, key: &Bytes, expected: &Arc<RowVersion>, new: Arc<RowVersion>) -> bool {
        self.cas_head(key, Some(expected), new)
    }

    /// Drops the chain for `key`, returning the old head. Used by
    /// rollback when the undone write had created the key.
    pub fn remove_head(&self, key: &[u8]) -> Option<Arc<RowVersion>> {
        let mut state = self.state.write();
        let old = state.entries.remove(key);
        if old.is_some() {
            state.mark_dirty_for(key);
        }
        old
    }

    /// Marks the leaf owning `key` dirty. Called when a commit turns an
    /// uncommitted version into persistable state.
    pub fn touch_dirty(&self, key: &[u8]) {
        self.state.write().mark_dirty_for(key);
    }

    /// Drops committed tombstones no active transaction can still
    /// observe. Returns how many keys were evicted.
    pub fn evict_tombstones(&self, watermark: TxId) -> usize {
        let mut state = self.state.write();
        let dead: Vec<Bytes> = state
            .entries
            .iter()
            .filter(|(_, head)| {
                let ts = head.commit_ts();
                ts != 0 && ts <= watermark && head.payload().is_none()
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            state.entries.remove(key);
        }
        dead.len()
    }

    /// Reads and decodes a persisted page.
    pub fn read_page(&self, pos: PagePos) -> Result<Page> {
        Page::decode(&self.manager.read_page(pos)?)
    }

    /// Persists all dirty leaves (committed rows only) into one new
    /// chunk, then a new root. Returns `false` when there was nothing
    /// to write.
    pub fn save(&self) -> Result<bool> {
        let _save = self.save_lock.lock();
        let mut state = self.state.write();

        let dirty: Vec<usize> = state
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.dirty)
            .map(|(i, _)| i)
            .collect();
        if dirty.is_empty() && state.root_pos.is_some() {
            return Ok(false);
        }

        // Serialize each dirty leaf's committed rows, split oversized
        // ones, all before any file is created.
        let mut plans: HashMap<usize, Vec<Vec<LeafEntry>>> = HashMap::new();
        for &i in &dirty {
            let lo: Bound<&[u8]> = if i == 0 {
                Bound::Unbounded
            } else {
                Bound::Included(state.leaves[i].first_key.as_ref())
            };
            let hi: Bound<&[u8]> = match state.leaves.get(i + 1) {
                Some(next) => Bound::Excluded(next.first_key.as_ref()),
                None => Bound::Unbounded,
            };
            let mut rows = Vec::new();
            for (key, head) in state.entries.range::<[u8], _>((lo, hi)) {
                if let Some((ts, Some(value))) = head.latest_committed() {
                    rows.push(LeafEntry {
                        key: key.clone(),
                        commit_ts: ts,
                        value,
                    });
                }
            }
            plans.insert(i, split_rows(rows, self.page_split_size));
        }

        let wrote_rows = plans.values().any(|groups| !groups.is_empty());
        if !wrote_rows && state.root_pos.is_some() {
            // Only uncommitted work was pending; commits re-dirty their
            // leaves later, so the flags can drop now.
            for &i in &dirty {
                state.leaves[i].dirty = false;
            }
            return Ok(false);
        }

        let id = self.manager.allocate_chunk_id();
        let mut writer = ChunkWriter::create(self.manager.dir(), id)?;
        let mut removed: Vec<PagePos> = Vec::new();
        let mut max_ts = state.max_saved_ts;
        let mut new_slots: Vec<LeafSlot> = Vec::with_capacity(state.leaves.len());

        for (i, slot) in state.leaves.iter().enumerate() {
            let Some(groups) = plans.get(&i) else {
                new_slots.push(slot.clone());
                continue;
            };
            if let Some(old) = slot.pos {
                removed.push(old);
            }
            if groups.is_empty() {
                new_slots.push(LeafSlot {
                    first_key: slot.first_key.clone(),
                    pos: None,
                    dirty: false,
                });
                continue;
            }
            for (g, rows) in groups.iter().enumerate() {
                let first_key = if g == 0 {
                    // Keep the original boundary so the slot still
                    // covers keys below its smallest row.
                    slot.first_key.clone()
                } else {
                    rows[0].key.clone()
                };
                for row in rows {
                    max_ts = max_ts.max(row.commit_ts);
                }
                let pos = match writer.append_page(PageKind::Leaf, &encode_leaf(rows)) {
                    Ok(pos) => pos,
                    Err(err) => {
                        let _ = writer.discard();
                        return Err(err);
                    }
                };
                new_slots.push(LeafSlot {
                    first_key,
                    pos: Some(pos),
                    dirty: false,
                });
            }
        }

        let children: Vec<ChildRef> = new_slots
            .iter()
            .filter_map(|slot| {
                slot.pos.map(|pos| ChildRef {
                    first_key: slot.first_key.clone(),
                    pos,
                })
            })
            .collect();
        let root_pos = match writer.append_page(PageKind::Internal, &encode_internal(&children)) {
            Ok(pos) => pos,
            Err(err) => {
                let _ = writer.discard();
                return Err(err);
            }
        };
        if let Some(old_root) = state.root_pos {
            removed.push(old_root);
        }
        let chunk = writer.finish(root_pos, max_ts)?;
        let page_count = chunk.page_lengths.len();
        self.manager.install_chunk(chunk);
        self.manager.add_removed_pages(removed.iter().copied());
        self.manager.persist_removed_pages()?;

        state.leaves = new_slots;
        state.root_pos = Some(root_pos);
        state.max_saved_ts = max_ts;
        debug!(
            store = self.name.as_str(),
            chunk = %id,
            pages = page_count,
            superseded = removed.len(),
            "saved store"
        );
        Ok(true)
    }

    /// Runs one compaction pass. Concurrent calls collapse into one:
    /// a pass already in flight makes this a no-op.
    pub fn compact(&self) -> Result<()> {
        let Some(_guard) = self.compact_lock.try_lock() else {
            return Ok(());
        };
        ChunkCompactor::new(self).execute()
    }
}

fn split_rows(rows: Vec<LeafEntry>, split_size: usize) -> Vec<Vec<LeafEntry>> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut groups = Vec::new();
    let mut current: Vec<LeafEntry> = Vec::new();
    let mut bytes = 0usize;
    for row in rows {
        let size = leaf_entry_encoded_len(row.key.len(), row.value.len());
        if !current.is_empty() && bytes + size > split_size {
            groups.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += size;
        current.push(row);
    }
    groups.push(current);
    groups
}
