//! Concurrent spatial index of tracked cells, with the two-tier lock discipline.
//!
//! Lock order is always "index, then cell". The index (a sharded [`DashMap`])
//! is held only long enough to find or create a cell's slot; the slot's own
//! mutex is taken afterwards, with the index released. Eviction is the one
//! place that holds both, and it acquires them in that same order.
//!
//! A [`CellRef`] can only be obtained from the [`CellIndex`], so there is no way
//! to lock a cell without first resolving it through the index.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::cell::CellEntry;
use crate::chunk::{CellPos, ChunkPayload};

struct CellSlot<D: ChunkPayload> {
    entry: Mutex<CellEntry<D>>,
}

/// A resolved cell. Holding one does not keep the cell tracked.
pub(crate) struct CellRef<D: ChunkPayload> {
    slot: Arc<CellSlot<D>>,
}

impl<D: ChunkPayload> Clone for CellRef<D> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<D: ChunkPayload> CellRef<D> {
    /// Takes the cell's exclusive section.
    ///
    /// Returns `None` if the cell was evicted after it was resolved.
    pub(crate) fn lock(&self) -> Option<CellGuard<'_, D>> {
        let entry = self.slot.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if entry.is_retired() {
            return None;
        }
        Some(CellGuard { entry })
    }
}

/// Exclusive access to a live cell.
pub(crate) struct CellGuard<'a, D: ChunkPayload> {
    entry: MutexGuard<'a, CellEntry<D>>,
}

impl<D: ChunkPayload> std::ops::Deref for CellGuard<'_, D> {
    type Target = CellEntry<D>;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl<D: ChunkPayload> std::ops::DerefMut for CellGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry
    }
}

/// Map from cell position to the cell's slot.
pub(crate) struct CellIndex<D: ChunkPayload> {
    cells: DashMap<CellPos, Arc<CellSlot<D>>, FxBuildHasher>,
}

impl<D: ChunkPayload> CellIndex<D> {
    pub(crate) fn new() -> Self {
        Self {
            cells: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Resolves a tracked cell.
    pub(crate) fn resolve(&self, pos: CellPos) -> Option<CellRef<D>> {
        self.cells.get(&pos).map(|slot| CellRef {
            slot: Arc::clone(slot.value()),
        })
    }

    /// Runs `f` inside the cell's exclusive section, creating the cell if needed.
    ///
    /// Retries when the resolved cell is evicted before it could be locked.
    pub(crate) fn update<R>(&self, pos: CellPos, mut f: impl FnMut(&mut CellEntry<D>) -> R) -> R {
        loop {
            let cell = self.resolve_or_create(pos);
            if let Some(mut guard) = cell.lock() {
                return f(&mut guard);
            }
        }
    }

    /// Runs `f` inside the cell's exclusive section if the cell is tracked.
    pub(crate) fn update_existing<R>(
        &self,
        pos: CellPos,
        f: impl FnOnce(&mut CellEntry<D>) -> R,
    ) -> Option<R> {
        let cell = self.resolve(pos)?;
        let mut guard = cell.lock()?;
        Some(f(&mut guard))
    }

    /// Copies out every tracked cell, releasing the index before returning.
    pub(crate) fn snapshot(&self) -> Vec<CellRef<D>> {
        self.cells
            .iter()
            .map(|slot| CellRef {
                slot: Arc::clone(slot.value()),
            })
            .collect()
    }

    /// Drops the cell from the index if `evictable` holds under its lock.
    ///
    /// The removed cell is marked retired so late lockers re-resolve.
    pub(crate) fn evict_if(
        &self,
        pos: CellPos,
        evictable: impl FnOnce(&CellEntry<D>) -> bool,
    ) -> bool {
        self.cells
            .remove_if(&pos, |_, slot| {
                let mut entry = slot.entry.lock().unwrap_or_else(PoisonError::into_inner);
                if entry.is_retired() || !evictable(&entry) {
                    return false;
                }
                entry.retire();
                true
            })
            .is_some()
    }

    /// Number of tracked cells.
    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    fn resolve_or_create(&self, pos: CellPos) -> CellRef<D> {
        let slot = self
            .cells
            .entry(pos)
            .or_insert_with(|| {
                Arc::new(CellSlot {
                    entry: Mutex::new(CellEntry::new(pos)),
                })
            })
            .value()
            .clone();
        CellRef { slot }
    }
}
