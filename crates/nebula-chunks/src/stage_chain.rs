//! The ordered, extensible list of readiness stages a cell advances through.
//!
//! Stages live in an arena of slots and are addressed by [`StageId`] handles
//! carrying the slot's version. Removing a stage retires its slot and bumps
//! the version, so every stale handle is detected instead of dangling. The
//! chain is mutable until [`StageChain::finish_setup`] seals it, which happens
//! once when the owning world starts operating.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use rustc_hash::FxHashMap;

use crate::chunk::ChunkPayload;
use crate::error::StageChainError;
use crate::key::NamespaceKey;
use crate::task::{ChunkGenerationTask, ChunkLoadTask};

static NEXT_CHAIN_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of a [`StageChain`]; stage handles remember which chain issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(u32);

/// Stable handle to a stage.
///
/// Handles are cheap to copy and compare. Whether a handle still refers to a
/// live stage is answered by [`StageChain::is_stage_valid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageId {
    chain: ChainId,
    slot: u32,
    version: u32,
}

impl StageId {
    /// The chain that issued this handle.
    pub fn chain(&self) -> ChainId {
        self.chain
    }
}

struct StageNode<D: ChunkPayload> {
    key: NamespaceKey,
    load_task: Arc<dyn ChunkLoadTask<D>>,
    generation_task: Arc<dyn ChunkGenerationTask<D>>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<D: ChunkPayload> {
    version: u32,
    node: Option<StageNode<D>>,
}

/// Doubly-linked list of stages backed by a slot arena.
pub struct StageChain<D: ChunkPayload> {
    id: ChainId,
    slots: Vec<Slot<D>>,
    /// Retired slots available for reuse.
    free: Vec<u32>,
    keys: FxHashMap<NamespaceKey, u32>,
    first: Option<u32>,
    last: Option<u32>,
    len: usize,
    sealed: bool,
    /// Slot indices in chain order; filled when sealed.
    order: Vec<u32>,
    /// Chain position per slot index; filled when sealed.
    positions: Vec<u32>,
}

impl<D: ChunkPayload> StageChain<D> {
    /// Creates an empty, modifiable chain.
    pub fn new() -> Self {
        Self {
            id: ChainId(NEXT_CHAIN_ID.fetch_add(1, AtomicOrdering::Relaxed)),
            slots: Vec::new(),
            free: Vec::new(),
            keys: FxHashMap::default(),
            first: None,
            last: None,
            len: 0,
            sealed: false,
            order: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Identity of this chain.
    pub fn id(&self) -> ChainId {
        self.id
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Inserts a stage at the beginning of the chain.
    pub fn create_first(
        &mut self,
        key: NamespaceKey,
        load_task: Arc<dyn ChunkLoadTask<D>>,
        generation_task: Arc<dyn ChunkGenerationTask<D>>,
    ) -> Result<StageId, StageChainError> {
        self.check_insert(&key)?;
        Ok(self.link(None, self.first, key, load_task, generation_task))
    }

    /// Inserts a stage at the end of the chain.
    pub fn create_last(
        &mut self,
        key: NamespaceKey,
        load_task: Arc<dyn ChunkLoadTask<D>>,
        generation_task: Arc<dyn ChunkGenerationTask<D>>,
    ) -> Result<StageId, StageChainError> {
        self.check_insert(&key)?;
        Ok(self.link(self.last, None, key, load_task, generation_task))
    }

    /// Inserts a stage directly before `anchor`.
    pub fn create_before(
        &mut self,
        anchor: StageId,
        key: NamespaceKey,
        load_task: Arc<dyn ChunkLoadTask<D>>,
        generation_task: Arc<dyn ChunkGenerationTask<D>>,
    ) -> Result<StageId, StageChainError> {
        let prev = self.node(anchor)?.prev;
        self.check_insert(&key)?;
        Ok(self.link(prev, Some(anchor.slot), key, load_task, generation_task))
    }

    /// Inserts a stage directly after `anchor`.
    pub fn create_after(
        &mut self,
        anchor: StageId,
        key: NamespaceKey,
        load_task: Arc<dyn ChunkLoadTask<D>>,
        generation_task: Arc<dyn ChunkGenerationTask<D>>,
    ) -> Result<StageId, StageChainError> {
        let next = self.node(anchor)?.next;
        self.check_insert(&key)?;
        Ok(self.link(Some(anchor.slot), next, key, load_task, generation_task))
    }

    /// Removes a stage and relinks its neighbours.
    ///
    /// The handle (and every copy of it) is invalid afterwards.
    pub fn remove(&mut self, stage: StageId) -> Result<(), StageChainError> {
        let (prev, next) = {
            let node = self.node(stage)?;
            (node.prev, node.next)
        };
        if self.sealed {
            return Err(StageChainError::Sealed);
        }

        match prev {
            Some(p) => self.node_at_mut(p).next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.node_at_mut(n).prev = prev,
            None => self.last = prev,
        }

        let slot = &mut self.slots[stage.slot as usize];
        if let Some(node) = slot.node.take() {
            self.keys.remove(&node.key);
        }
        slot.version = slot.version.wrapping_add(1);
        self.free.push(stage.slot);
        self.len -= 1;
        Ok(())
    }

    /// Seals the chain; idempotent.
    ///
    /// Afterwards every insertion and removal fails with
    /// [`StageChainError::Sealed`], and positions are answered in O(1).
    pub fn finish_setup(&mut self) {
        if self.sealed {
            return;
        }
        self.order = self.walk().collect();
        self.positions = vec![u32::MAX; self.slots.len()];
        for (position, &slot) in self.order.iter().enumerate() {
            self.positions[slot as usize] = position as u32;
        }
        self.sealed = true;
    }

    /// Returns `true` until the chain is sealed.
    pub fn is_modifiable(&self) -> bool {
        !self.sealed
    }

    /// A chain is valid when it holds at least one stage.
    pub fn is_valid(&self) -> bool {
        self.len > 0
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Number of live stages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the chain holds no stage.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The stage every cell starts with.
    pub fn first(&self) -> Option<StageId> {
        self.first.map(|slot| self.handle(slot))
    }

    /// The stage of fully loaded, tickable cells.
    pub fn last(&self) -> Option<StageId> {
        self.last.map(|slot| self.handle(slot))
    }

    /// Looks a stage up by key.
    pub fn stage(&self, key: &NamespaceKey) -> Option<StageId> {
        self.keys.get(key).map(|&slot| self.handle(slot))
    }

    /// Stages in chain order.
    pub fn iter(&self) -> impl Iterator<Item = StageId> + '_ {
        self.walk().map(|slot| self.handle(slot))
    }

    /// Returns `true` if `stage` is a live stage of this chain.
    pub fn is_stage_valid(&self, stage: StageId) -> bool {
        self.node(stage).is_ok()
    }

    /// Key the stage was registered under.
    pub fn key(&self, stage: StageId) -> Result<&NamespaceKey, StageChainError> {
        Ok(&self.node(stage)?.key)
    }

    /// The stage's load task.
    pub fn load_task(&self, stage: StageId) -> Result<&Arc<dyn ChunkLoadTask<D>>, StageChainError> {
        Ok(&self.node(stage)?.load_task)
    }

    /// The stage's generation task.
    pub fn generation_task(
        &self,
        stage: StageId,
    ) -> Result<&Arc<dyn ChunkGenerationTask<D>>, StageChainError> {
        Ok(&self.node(stage)?.generation_task)
    }

    /// The stage before `stage`, if any.
    pub fn previous(&self, stage: StageId) -> Result<Option<StageId>, StageChainError> {
        Ok(self.node(stage)?.prev.map(|slot| self.handle(slot)))
    }

    /// The stage after `stage`, if any.
    pub fn next(&self, stage: StageId) -> Result<Option<StageId>, StageChainError> {
        Ok(self.node(stage)?.next.map(|slot| self.handle(slot)))
    }

    /// The chain a live stage is registered to.
    pub fn owner(&self, stage: StageId) -> Result<ChainId, StageChainError> {
        self.node(stage)?;
        Ok(self.id)
    }

    /// Zero-based position of the stage in chain order.
    pub fn position(&self, stage: StageId) -> Result<usize, StageChainError> {
        self.node(stage)?;
        if self.sealed {
            return Ok(self.positions[stage.slot as usize] as usize);
        }
        Ok(self
            .walk()
            .position(|slot| slot == stage.slot)
            .unwrap_or(usize::MAX))
    }

    /// The stage at a chain position.
    pub fn stage_at(&self, position: usize) -> Option<StageId> {
        if self.sealed {
            return self.order.get(position).map(|&slot| self.handle(slot));
        }
        self.walk().nth(position).map(|slot| self.handle(slot))
    }

    /// Orders two stages of this chain by position.
    pub fn compare(&self, a: StageId, b: StageId) -> Result<Ordering, StageChainError> {
        Ok(self.position(a)?.cmp(&self.position(b)?))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_insert(&self, key: &NamespaceKey) -> Result<(), StageChainError> {
        if self.sealed {
            return Err(StageChainError::Sealed);
        }
        if self.keys.contains_key(key) {
            return Err(StageChainError::DuplicateKey(key.clone()));
        }
        Ok(())
    }

    fn link(
        &mut self,
        prev: Option<u32>,
        next: Option<u32>,
        key: NamespaceKey,
        load_task: Arc<dyn ChunkLoadTask<D>>,
        generation_task: Arc<dyn ChunkGenerationTask<D>>,
    ) -> StageId {
        let node = StageNode {
            key: key.clone(),
            load_task,
            generation_task,
            prev,
            next,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize].node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot {
                    version: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };

        match prev {
            Some(p) => self.node_at_mut(p).next = Some(slot),
            None => self.first = Some(slot),
        }
        match next {
            Some(n) => self.node_at_mut(n).prev = Some(slot),
            None => self.last = Some(slot),
        }
        self.keys.insert(key, slot);
        self.len += 1;
        self.handle(slot)
    }

    fn handle(&self, slot: u32) -> StageId {
        StageId {
            chain: self.id,
            slot,
            version: self.slots[slot as usize].version,
        }
    }

    fn node(&self, stage: StageId) -> Result<&StageNode<D>, StageChainError> {
        if stage.chain != self.id {
            return Err(StageChainError::ForeignStage);
        }
        self.slots
            .get(stage.slot as usize)
            .filter(|slot| slot.version == stage.version)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(StageChainError::StageRemoved)
    }

    /// Links are only ever stored for live slots.
    fn node_at_mut(&mut self, slot: u32) -> &mut StageNode<D> {
        match self.slots[slot as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("stage link points at a retired slot"),
        }
    }

    fn walk(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::successors(self.first, move |&slot| {
            self.slots[slot as usize].node.as_ref().and_then(|n| n.next)
        })
    }
}

impl<D: ChunkPayload> Default for StageChain<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ChunkPayload> fmt::Debug for StageChain<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self
            .walk()
            .filter_map(|slot| self.slots[slot as usize].node.as_ref())
            .map(|node| node.key.to_string())
            .collect();
        f.debug_struct("StageChain")
            .field("id", &self.id)
            .field("stages", &keys)
            .field("sealed", &self.sealed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
