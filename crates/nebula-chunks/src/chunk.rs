//! Cell coordinates and the shared chunk handle handed to tasks and callers.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

/// Identifies a cell (column chunk) in chunk coordinate space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    /// Chunk-grid X coordinate.
    pub x: i32,
    /// Chunk-grid Z coordinate.
    pub z: i32,
}

impl CellPos {
    /// Creates a new cell position.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chebyshev distance; a level-`L` demand covers every cell with distance `<= L`.
    pub fn chebyshev(self, other: CellPos) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    /// Iterates over the `(2L+1)^2` square of cells centred on `self`, row by row.
    ///
    /// Cells beyond the `i32` coordinate range are skipped.
    pub fn square(self, level: u32) -> impl Iterator<Item = CellPos> {
        let xs = clamped_span(self.x, level);
        clamped_span(self.z, level)
            .flat_map(move |z| xs.clone().map(move |x| CellPos::new(x, z)))
    }

    /// The batch region this cell falls into for a given batch span.
    pub fn region(self, span: u32) -> (i32, i32) {
        let span = span.max(1) as i32;
        (self.x.div_euclid(span), self.z.div_euclid(span))
    }
}

fn clamped_span(center: i32, level: u32) -> RangeInclusive<i32> {
    let r = i64::from(level);
    let low = (i64::from(center) - r).max(i64::from(i32::MIN));
    let high = (i64::from(center) + r).min(i64::from(i32::MAX));
    // Both ends are clamped into i32 range above.
    low as i32..=high as i32
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Marker for the per-cell payload filled in by load and generation tasks.
///
/// The payload layout is owned entirely by the tasks.
pub trait ChunkPayload: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> ChunkPayload for T {}

/// A cell's data, shared between the scheduler, its tasks, and callers.
///
/// The handle stays valid after the cell is evicted; it is simply no longer
/// tracked by the scheduler.
#[derive(Debug)]
pub struct Chunk<D> {
    pos: CellPos,
    data: RwLock<D>,
}

impl<D: ChunkPayload> Chunk<D> {
    pub(crate) fn new(pos: CellPos) -> Self {
        Self {
            pos,
            data: RwLock::new(D::default()),
        }
    }

    /// Position of this chunk.
    pub fn pos(&self) -> CellPos {
        self.pos
    }

    /// Chunk-grid X coordinate.
    pub fn x(&self) -> i32 {
        self.pos.x
    }

    /// Chunk-grid Z coordinate.
    pub fn z(&self) -> i32 {
        self.pos.z
    }

    /// Shared access to the payload.
    pub fn read(&self) -> RwLockReadGuard<'_, D> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the payload.
    pub fn write(&self) -> RwLockWriteGuard<'_, D> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}
