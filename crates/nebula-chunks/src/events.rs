//! Chunk lifecycle events.
//!
//! The scheduler records what happened to cells during a tick so that
//! downstream consumers (viewer tracking, persistence) can react without
//! polling every cell. Events are double-buffered per tick.

use crate::chunk::CellPos;
use crate::stage_chain::StageId;

/// Something that happened to a cell during a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// The cell's cursor advanced to `stage`.
    StageReached {
        /// The cell that advanced.
        pos: CellPos,
        /// The stage now reached.
        stage: StageId,
    },
    /// One generation invocation committed `stage` for a batch of cells.
    Generated {
        /// Every cell of the batch.
        cells: Vec<CellPos>,
        /// The generated stage.
        stage: StageId,
    },
    /// A task failed while advancing the cell to `stage`.
    Failed {
        /// The cell that failed.
        pos: CellPos,
        /// The stage that could not be reached.
        stage: StageId,
        /// Whether the cell is parked until eviction.
        fatal: bool,
    },
    /// The cell was dropped from the scheduler.
    Evicted {
        /// The evicted cell.
        pos: CellPos,
    },
}

impl ChunkEvent {
    /// Returns `true` if the event concerns `pos`.
    pub fn involves(&self, pos: CellPos) -> bool {
        match self {
            ChunkEvent::StageReached { pos: p, .. }
            | ChunkEvent::Failed { pos: p, .. }
            | ChunkEvent::Evicted { pos: p } => *p == pos,
            ChunkEvent::Generated { cells, .. } => cells.contains(&pos),
        }
    }
}

/// Double-buffered event storage.
///
/// Events written in the current tick are readable in the current and next
/// tick. After two [`swap`](ChunkEventBuffer::swap) calls, events are dropped.
#[derive(Debug, Default)]
pub struct ChunkEventBuffer {
    /// Events from the previous tick (readable).
    prev: Vec<ChunkEvent>,
    /// Events from the current tick (being written).
    current: Vec<ChunkEvent>,
}

impl ChunkEventBuffer {
    /// Creates a new empty event buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event for the current tick.
    pub fn send(&mut self, event: ChunkEvent) {
        self.current.push(event);
    }

    /// Returns all readable events (previous + current tick).
    pub fn read(&self) -> impl Iterator<Item = &ChunkEvent> {
        self.prev.iter().chain(self.current.iter())
    }

    /// Returns the number of readable events.
    pub fn len(&self) -> usize {
        self.prev.len() + self.current.len()
    }

    /// Returns `true` if there are no readable events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances the tick: previous events are dropped, current becomes previous.
    pub fn swap(&mut self) {
        self.prev.clear();
        std::mem::swap(&mut self.prev, &mut self.current);
    }

    /// Clears all events from both buffers.
    pub fn clear(&mut self) {
        self.prev.clear();
        self.current.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evicted(x: i32) -> ChunkEvent {
        ChunkEvent::Evicted {
            pos: CellPos::new(x, 0),
        }
    }

    #[test]
    fn test_events_survive_one_swap() {
        let mut events = ChunkEventBuffer::new();
        events.send(evicted(1));
        assert_eq!(events.len(), 1);

        events.swap();
        events.send(evicted(2));
        let read: Vec<_> = events.read().cloned().collect();
        assert_eq!(read, vec![evicted(1), evicted(2)]);

        events.swap();
        assert_eq!(events.read().cloned().collect::<Vec<_>>(), vec![evicted(2)]);

        events.swap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut events = ChunkEventBuffer::new();
        events.send(evicted(1));
        events.swap();
        events.send(evicted(2));
        events.clear();
        assert!(events.is_empty());
    }

    #[test]
    fn test_involves_batch_members() {
        let single = evicted(3);
        assert!(single.involves(CellPos::new(3, 0)));
        assert!(!single.involves(CellPos::new(3, 1)));

        let mut chain: crate::StageChain<()> = crate::StageChain::new();
        let stage = chain
            .create_last(
                crate::NamespaceKey::nebula("features").unwrap(),
                std::sync::Arc::new(crate::EmptyLoadTask),
                std::sync::Arc::new(crate::EmptyGenerationTask),
            )
            .unwrap();
        let batch = ChunkEvent::Generated {
            cells: vec![CellPos::new(0, 0), CellPos::new(1, 0)],
            stage,
        };
        assert!(batch.involves(CellPos::new(1, 0)));
        assert!(!batch.involves(CellPos::new(2, 0)));
    }
}
