//! Chunk garbage reclamation.
//!
//! A compaction pass first deletes chunks whose pages are all in the
//! removed-page set, then picks the emptiest remaining chunks (up to a
//! byte budget) and rewrites their live leaves with no-op head
//! replacements. The touched leaves land in a fresh chunk on the next
//! save, which turns the old chunks fully garbage so a final sweep can
//! delete them too.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::storage::btree::BTreeStore;
use crate::storage::chunk::Chunk;
use crate::types::{PagePos, Result};

/// One compaction pass over a store.
pub struct ChunkCompactor<'a> {
    store: &'a BTreeStore,
}

impl<'a> ChunkCompactor<'a> {
    /// Binds a pass to its store.
    pub fn new(store: &'a BTreeStore) -> ChunkCompactor<'a> {
        ChunkCompactor { store }
    }

    /// Runs the pass: delete fully garbage chunks, rewrite the live
    /// remainder of the emptiest ones, save, and sweep again.
    pub fn execute(&self) -> Result<()> {
        let manager = self.store.manager();
        let mut removed = manager.removed_snapshot();
        if removed.is_empty() {
            return Ok(());
        }

        self.remove_unused_chunks(&mut removed)?;
        if self.store.min_fill_rate() == 0 {
            return Ok(());
        }
        if removed.is_empty() {
            return Ok(());
        }

        let candidates = self.select_rewrite_candidates(&removed)?;
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(
            store = self.store.name(),
            candidates = candidates.len(),
            rewrite_bytes = candidates.iter().map(|c| c.live_page_bytes).sum::<u64>(),
            "rewriting low-fill chunks"
        );

        if self.rewrite(&candidates, &removed)? {
            self.store.save()?;
            let mut removed = manager.removed_snapshot();
            self.remove_unused_chunks(&mut removed)?;
        }
        Ok(())
    }

    /// Deletes every chunk with zero live pages and shrinks both the
    /// caller's view and the persisted removed-page set.
    fn remove_unused_chunks(&self, removed: &mut BTreeSet<PagePos>) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        let manager = self.store.manager();
        let unused = self.find_unused_chunks(removed)?;
        if unused.is_empty() {
            return Ok(());
        }
        for chunk in &unused {
            for pos in manager.remove_unused_chunk(chunk.id)? {
                removed.remove(&pos);
            }
        }
        manager.persist_removed_pages()?;
        info!(
            store = self.store.name(),
            chunks = unused.len(),
            "deleted fully garbage chunks"
        );
        Ok(())
    }

    fn find_unused_chunks(&self, removed: &BTreeSet<PagePos>) -> Result<Vec<Chunk>> {
        let manager = self.store.manager();
        manager.materialize_all()?;
        let mut unused = Vec::new();
        for mut chunk in manager.chunks() {
            chunk.refresh_live(removed);
            if chunk.live_page_count == 0 {
                unused.push(chunk);
            }
        }
        Ok(unused)
    }

    /// Chunks at or below the fill-rate threshold, emptiest first,
    /// trimmed to the per-pass byte budget.
    fn select_rewrite_candidates(&self, removed: &BTreeSet<PagePos>) -> Result<Vec<Chunk>> {
        let manager = self.store.manager();
        manager.materialize_all()?;
        let mut old = Vec::new();
        for mut chunk in manager.chunks() {
            chunk.refresh_live(removed);
            if chunk.fill_rate() <= self.store.min_fill_rate() {
                old.push(chunk);
            }
        }
        Ok(pick_by_budget(old, self.store.max_compact_size()))
    }

    /// Touches the first key of every live leaf in the candidate set so
    /// the owning leaves are rewritten on the next save. Returns whether
    /// any touch landed.
    fn rewrite(&self, candidates: &[Chunk], removed: &BTreeSet<PagePos>) -> Result<bool> {
        let mut save_needed = false;
        for chunk in candidates {
            for pos in chunk.live_leaf_positions(removed) {
                let page = self.store.read_page(pos)?;
                if page.key_count() == 0 {
                    continue;
                }
                let Some(key) = page.key(0).cloned() else {
                    continue;
                };
                // A key deleted since the page was written simply skips
                // the touch; the page stays until its rows churn.
                if let Some(head) = self.store.get(&key) {
                    if self.store.replace(&key, &head, Arc::clone(&head)) {
                        save_needed = true;
                    }
                }
            }
        }
        Ok(save_needed)
    }
}

/// Orders candidates by (fill rate, live bytes) ascending and keeps a
/// prefix whose live bytes fit the budget, always including the chunk
/// that crosses it.
fn pick_by_budget(mut old: Vec<Chunk>, max_bytes: u64) -> Vec<Chunk> {
    if old.is_empty() {
        return old;
    }
    old.sort_by(|a, b| {
        a.fill_rate()
            .cmp(&b.fill_rate())
            .then(a.live_page_bytes.cmp(&b.live_page_bytes))
    });
    let mut bytes = 0u64;
    for (i, chunk) in old.iter().enumerate() {
        bytes += chunk.live_page_bytes;
        if bytes > max_bytes {
            old.truncate(i + 1);
            break;
        }
    }
    old
}
