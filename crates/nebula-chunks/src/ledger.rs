//! Per-cell demand bookkeeping.
//!
//! A [`DemandLedger`] holds the demands placed directly on a cell (local) and
//! the copies spread to it from neighbouring cells (propagated). Its target is
//! the highest stage position among all of them. Stages are tracked by their
//! chain position, which is stable once the chain is sealed.

use crate::chunk::CellPos;
use crate::demand::Demand;

/// A demand placed directly on this cell, with its remaining lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LocalDemand {
    demand: Demand,
    position: usize,
    remaining: u32,
}

/// A demand spread to this cell from `origin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PropagatedDemand {
    origin: CellPos,
    demand: Demand,
    position: usize,
}

/// How a ledger mutation moved the cell's target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetChange {
    /// Target position before the mutation.
    pub before: Option<usize>,
    /// Target position after the mutation.
    pub after: Option<usize>,
}

impl TargetChange {
    /// Returns `true` if the target moved to a later stage (or appeared).
    pub fn raised(&self) -> bool {
        self.after > self.before
    }

    /// Returns `true` if the target moved to an earlier stage (or vanished).
    pub fn lowered(&self) -> bool {
        self.after < self.before
    }
}

/// Multisets of local and propagated demands for one cell.
#[derive(Clone, Debug, Default)]
pub struct DemandLedger {
    local: Vec<LocalDemand>,
    propagated: Vec<PropagatedDemand>,
    target: Option<usize>,
}

impl DemandLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest stage position required by any covering demand.
    pub fn target(&self) -> Option<usize> {
        self.target
    }

    /// Returns `true` if no demand covers the cell.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.propagated.is_empty()
    }

    /// Number of demands placed directly on the cell.
    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    /// Number of demands spread to the cell from neighbours.
    pub fn propagated_count(&self) -> usize {
        self.propagated.len()
    }

    /// Demands placed directly on the cell.
    pub fn local_demands(&self) -> impl Iterator<Item = &Demand> {
        self.local.iter().map(|l| &l.demand)
    }

    /// Records a demand placed on this cell; `position` is its stage's chain position.
    pub fn add_local(&mut self, demand: Demand, position: usize) -> TargetChange {
        self.local.push(LocalDemand {
            demand,
            position,
            remaining: demand.ticks_to_live(),
        });
        self.raise_to(position)
    }

    /// Records a demand spread from `origin`.
    pub fn add_propagated(&mut self, origin: CellPos, demand: Demand, position: usize) -> TargetChange {
        self.propagated.push(PropagatedDemand {
            origin,
            demand,
            position,
        });
        self.raise_to(position)
    }

    /// Removes one local instance equal to `demand`; `None` if there is none.
    pub fn remove_local(&mut self, demand: &Demand) -> Option<TargetChange> {
        let index = self.local.iter().position(|l| l.demand == *demand)?;
        self.local.swap_remove(index);
        Some(self.recompute())
    }

    /// Removes one propagated instance of `demand` from `origin`.
    pub fn remove_propagated(&mut self, origin: CellPos, demand: &Demand) -> Option<TargetChange> {
        let index = self
            .propagated
            .iter()
            .position(|p| p.origin == origin && p.demand == *demand)?;
        self.propagated.swap_remove(index);
        Some(self.recompute())
    }

    /// Counts one tick off every finite local demand already satisfied by
    /// `cursor`, and removes the ones whose lifetime ran out.
    ///
    /// While the cell is `failed`, unsatisfied demands count down as well;
    /// their futures have already been completed with the failure.
    ///
    /// Returns the expired demands; their propagated copies must be withdrawn
    /// by the caller.
    pub fn decay(&mut self, cursor: Option<usize>, failed: bool) -> (Vec<Demand>, TargetChange) {
        let mut expired = Vec::new();
        self.local.retain_mut(|l| {
            if l.demand.is_permanent() || (!failed && cursor < Some(l.position)) {
                return true;
            }
            l.remaining = l.remaining.saturating_sub(1);
            if l.remaining == 0 {
                expired.push(l.demand);
                return false;
            }
            true
        });
        let change = if expired.is_empty() {
            TargetChange {
                before: self.target,
                after: self.target,
            }
        } else {
            self.recompute()
        };
        (expired, change)
    }

    fn raise_to(&mut self, position: usize) -> TargetChange {
        let before = self.target;
        if before < Some(position) {
            self.target = Some(position);
        }
        TargetChange {
            before,
            after: self.target,
        }
    }

    fn recompute(&mut self) -> TargetChange {
        let before = self.target;
        self.target = self
            .local
            .iter()
            .map(|l| l.position)
            .chain(self.propagated.iter().map(|p| p.position))
            .max();
        TargetChange {
            before,
            after: self.target,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
