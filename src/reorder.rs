use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::error::TransferError;

#[derive(Debug, Default)]
struct PendingBlock {
    done: bool,
    chunks: Vec<Bytes>,
}

/// Holds blocks that finished out of order until every block before them has
/// been flushed, and tracks the progress reported for bytes not yet flushed.
///
/// Blocks below `active_index` have been written to the sink; an index in that
/// prefix is never accepted again.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, PendingBlock>,
    incomplete_progress: HashMap<u64, u64>,
    active_index: u64,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            incomplete_progress: HashMap::new(),
            active_index: 1,
        }
    }

    /// Smallest block index not yet flushed.
    pub fn active_index(&self) -> u64 {
        self.active_index
    }

    /// Move the active index to the first block of a new page. Never moves
    /// backwards.
    pub fn begin_page(&mut self, first_index: u64) {
        self.active_index = self.active_index.max(first_index);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_done(&self, index: u64) -> bool {
        self.pending.get(&index).is_some_and(|b| b.done)
    }

    /// True when `index` may claim a buffer slot: it lies within `window`
    /// blocks of the active index. Slots are therefore claimed in index
    /// order and the active block always has room.
    pub fn has_slot_for(&self, index: u64, window: usize) -> bool {
        index < self.active_index + window as u64
    }

    /// Create an empty, not-done entry for `index`.
    pub fn reserve(&mut self, index: u64) -> Result<(), TransferError> {
        if index < self.active_index {
            return Err(TransferError::Internal(format!(
                "block {index} was already flushed (active {})",
                self.active_index
            )));
        }
        self.pending.entry(index).or_default();
        Ok(())
    }

    pub fn push_chunk(&mut self, index: u64, chunk: Bytes) {
        if index < self.active_index {
            return;
        }
        self.pending.entry(index).or_default().chunks.push(chunk);
    }

    pub fn mark_done(&mut self, index: u64) {
        if index < self.active_index {
            return;
        }
        self.pending.entry(index).or_default().done = true;
    }

    pub fn record_progress(&mut self, index: u64, bytes: u64) {
        *self.incomplete_progress.entry(index).or_insert(0) += bytes;
    }

    /// Progress reported for bytes that have not reached the sink.
    pub fn unflushed_progress(&self) -> u64 {
        self.incomplete_progress.values().sum()
    }

    /// Progress reported for blocks that are still streaming. A revert
    /// retracts exactly this amount.
    pub fn in_progress_bytes(&self) -> u64 {
        self.incomplete_progress
            .iter()
            .filter(|(index, _)| !self.is_done(**index))
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    /// Remove the active block if it is complete and advance past it.
    pub fn take_flushable(&mut self) -> Option<(u64, Vec<Bytes>)> {
        let index = self.active_index;
        if !self.is_done(index) {
            return None;
        }
        let block = self.pending.remove(&index)?;
        self.incomplete_progress.remove(&index);
        self.active_index += 1;
        Some((index, block.chunks))
    }

    /// Drop every block that has not finished and return the progress
    /// reported for them. Finished blocks stay buffered with their progress.
    pub fn revert(&mut self) -> u64 {
        let dropped: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, b)| !b.done)
            .map(|(index, _)| *index)
            .collect();
        for index in &dropped {
            self.pending.remove(index);
        }

        let mut retracted = 0;
        let pending = &self.pending;
        self.incomplete_progress.retain(|index, bytes| {
            if pending.get(index).is_some_and(|b| b.done) {
                true
            } else {
                retracted += *bytes;
                false
            }
        });
        retracted
    }
}
