//! State kept for every tracked cell: its ledger, pipeline cursor, and waiters.

use std::sync::Arc;

use crate::chunk::{CellPos, Chunk, ChunkPayload};
use crate::demand::{ChunkAndDemand, Demand, DemandSender};
use crate::error::SchedulerError;
use crate::ledger::DemandLedger;

/// Where a cell stands in its pipeline.
#[derive(Clone, Debug)]
pub(crate) enum PipelineState {
    /// No task in flight.
    Idle,
    /// The load task for the stage at this position is running.
    Loading(usize),
    /// The load task found nothing; waiting to be batched for generation.
    AwaitingGeneration(usize),
    /// A generation batch containing this cell is running.
    Generating(usize),
    /// The last step failed. Transient failures carry the tick from which a
    /// retry is allowed; fatal ones park the cell until it is evicted.
    Failed {
        position: usize,
        retry_at: Option<u64>,
        error: SchedulerError,
    },
}

/// A pending future waiting for the cell to reach `position`.
pub(crate) struct Waiter<D> {
    demand: Demand,
    position: usize,
    tx: DemandSender<D>,
}

pub(crate) struct CellEntry<D: ChunkPayload> {
    pos: CellPos,
    chunk: Arc<Chunk<D>>,
    pub(crate) ledger: DemandLedger,
    /// Position of the highest stage fully reached.
    cursor: Option<usize>,
    pub(crate) pipeline: PipelineState,
    waiters: Vec<Waiter<D>>,
    retired: bool,
}

impl<D: ChunkPayload> CellEntry<D> {
    pub(crate) fn new(pos: CellPos) -> Self {
        Self {
            pos,
            chunk: Arc::new(Chunk::new(pos)),
            ledger: DemandLedger::new(),
            cursor: None,
            pipeline: PipelineState::Idle,
            waiters: Vec::new(),
            retired: false,
        }
    }

    pub(crate) fn pos(&self) -> CellPos {
        self.pos
    }

    pub(crate) fn chunk(&self) -> &Arc<Chunk<D>> {
        &self.chunk
    }

    pub(crate) fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// Returns `true` while a task for this cell is queued or running.
    pub(crate) fn is_in_flight(&self) -> bool {
        matches!(
            self.pipeline,
            PipelineState::Loading(_)
                | PipelineState::AwaitingGeneration(_)
                | PipelineState::Generating(_)
        )
    }

    /// Returns `true` while the last step has failed and no retry is running.
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self.pipeline, PipelineState::Failed { .. })
    }

    /// Position of the next stage to start, if the cell may advance at tick `now`.
    pub(crate) fn next_step(&self, now: u64) -> Option<usize> {
        let next = self.cursor.map_or(0, |c| c + 1);
        if self.ledger.target() < Some(next) {
            return None;
        }
        match self.pipeline {
            PipelineState::Idle => Some(next),
            PipelineState::Failed {
                retry_at: Some(at), ..
            } if at <= now => Some(next),
            _ => None,
        }
    }

    /// No demand, no task, nobody waiting.
    pub(crate) fn is_evictable(&self) -> bool {
        self.ledger.is_empty() && !self.is_in_flight() && self.waiters.is_empty()
    }

    /// Registers a future; it is completed at once if the cell is already there
    /// or is parked on a fatal failure below `position`.
    pub(crate) fn add_waiter(&mut self, demand: Demand, position: usize, tx: DemandSender<D>) {
        if self.cursor >= Some(position) {
            let _ = tx.send(Ok(self.pair(demand)));
            return;
        }
        if let PipelineState::Failed {
            retry_at: None,
            error,
            ..
        } = &self.pipeline
        {
            let _ = tx.send(Err(error.clone()));
            return;
        }
        self.waiters.push(Waiter {
            demand,
            position,
            tx,
        });
    }

    /// Records that the stage at `position` has been committed.
    ///
    /// Returns the number of futures completed.
    pub(crate) fn commit(&mut self, position: usize) -> usize {
        debug_assert_eq!(self.cursor.map_or(0, |c| c + 1), position);
        self.cursor = Some(position);
        self.pipeline = PipelineState::Idle;

        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.position <= position);
        self.waiters = pending;
        let completed = ready.len();
        for waiter in ready {
            let _ = waiter.tx.send(Ok(self.pair(waiter.demand)));
        }
        completed
    }

    /// Records a failed step and fails every future waiting at or past it.
    pub(crate) fn fail(&mut self, position: usize, retry_at: Option<u64>, error: SchedulerError) {
        let (failed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.position >= position);
        self.waiters = pending;
        for waiter in failed {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        self.pipeline = PipelineState::Failed {
            position,
            retry_at,
            error,
        };
    }

    /// Completes one future registered for `demand` with
    /// [`SchedulerError::DemandWithdrawn`], if more futures wait for it than
    /// local instances of it remain.
    pub(crate) fn withdraw_waiter(&mut self, demand: &Demand) -> bool {
        let remaining = self.ledger.local_demands().filter(|d| *d == demand).count();
        let waiting = self.waiters.iter().filter(|w| w.demand == *demand).count();
        if waiting <= remaining {
            return false;
        }
        match self.waiters.iter().position(|w| w.demand == *demand) {
            Some(index) => {
                let waiter = self.waiters.swap_remove(index);
                let _ = waiter.tx.send(Err(SchedulerError::DemandWithdrawn));
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    fn pair(&self, demand: Demand) -> ChunkAndDemand<D> {
        ChunkAndDemand {
            chunk: Arc::clone(&self.chunk),
            demand,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demand::DemandFuture;
    use crate::key::NamespaceKey;
    use crate::stage_chain::{StageChain, StageId};
    use crate::task::{EmptyGenerationTask, EmptyLoadTask};

    fn two_stages() -> [StageId; 2] {
        let mut chain: StageChain<()> = StageChain::new();
        let mut push = |path: &str| {
            chain
                .create_last(
                    NamespaceKey::nebula(path).unwrap(),
                    Arc::new(EmptyLoadTask),
                    Arc::new(EmptyGenerationTask),
                )
                .unwrap()
        };
        [push("a"), push("b")]
    }

    #[test]
    fn test_next_step_follows_target() {
        let [_, b] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        assert_eq!(entry.next_step(0), None);

        entry.ledger.add_local(Demand::new(b, 0, 0, 0), 1);
        assert_eq!(entry.next_step(0), Some(0));

        entry.pipeline = PipelineState::Loading(0);
        assert_eq!(entry.next_step(0), None);
        entry.commit(0);
        assert_eq!(entry.next_step(0), Some(1));
        entry.commit(1);
        assert_eq!(entry.next_step(0), None);
    }

    #[test]
    fn test_waiters_resolve_on_commit() {
        let [a, b] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        let da = Demand::new(a, 0, 0, 0);
        let db = Demand::new(b, 0, 0, 0);
        let (tx_a, mut fut_a) = DemandFuture::channel(da);
        let (tx_b, mut fut_b) = DemandFuture::channel(db);
        entry.add_waiter(da, 0, tx_a);
        entry.add_waiter(db, 1, tx_b);

        assert_eq!(entry.commit(0), 1);
        assert_eq!(fut_a.try_take().unwrap().unwrap().demand, da);
        assert!(fut_b.try_take().is_none());
        assert_eq!(entry.commit(1), 1);
        assert!(fut_b.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_satisfied_waiter_completes_immediately() {
        let [a, _] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        entry.commit(0);
        let demand = Demand::new(a, 0, 0, 0);
        let (tx, mut fut) = DemandFuture::channel(demand);
        entry.add_waiter(demand, 0, tx);
        assert!(fut.try_take().unwrap().is_ok());
        assert_eq!(entry.waiter_count(), 0);
    }

    #[test]
    fn test_failure_fails_waiters_past_stage() {
        let [a, b] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        entry.commit(0);
        let db = Demand::new(b, 0, 0, 0);
        let (tx, mut fut) = DemandFuture::channel(db);
        entry.add_waiter(db, 1, tx);

        entry.fail(1, None, SchedulerError::DemandWithdrawn);
        assert!(fut.try_take().unwrap().is_err());
        assert_eq!(entry.cursor(), Some(0));

        // Parked fatally: later waiters past the cursor fail at once.
        let (tx, mut fut) = DemandFuture::channel(db);
        entry.add_waiter(db, 1, tx);
        assert!(fut.try_take().unwrap().is_err());
        // At or below the cursor still succeeds.
        let da = Demand::new(a, 0, 0, 0);
        let (tx, mut fut) = DemandFuture::channel(da);
        entry.add_waiter(da, 0, tx);
        assert!(fut.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_transient_failure_retries_from_tick() {
        let [_, b] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        entry.ledger.add_local(Demand::new(b, 0, 0, 0), 1);
        entry.fail(0, Some(5), SchedulerError::DemandWithdrawn);
        assert_eq!(entry.next_step(4), None);
        assert_eq!(entry.next_step(5), Some(0));
    }

    #[test]
    fn test_evictable_only_when_unused() {
        let [a, _] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        assert!(entry.is_evictable());
        let demand = Demand::new(a, 0, 0, 0);
        entry.ledger.add_local(demand, 0);
        assert!(!entry.is_evictable());
        entry.ledger.remove_local(&demand);
        entry.pipeline = PipelineState::Loading(0);
        assert!(!entry.is_evictable());
        entry.pipeline = PipelineState::Idle;
        assert!(entry.is_evictable());
    }

    #[test]
    fn test_withdraw_keeps_waiters_backed_by_twins() {
        let [_, b] = two_stages();
        let mut entry: CellEntry<()> = CellEntry::new(CellPos::new(0, 0));
        let twin = Demand::new(b, 0, 0, 3);
        let (tx_one, mut one) = DemandFuture::channel(twin);
        let (tx_two, mut two) = DemandFuture::channel(twin);
        entry.ledger.add_local(twin, 1);
        entry.add_waiter(twin, 1, tx_one);
        entry.ledger.add_local(twin, 1);
        entry.add_waiter(twin, 1, tx_two);

        entry.ledger.remove_local(&twin);
        assert!(entry.withdraw_waiter(&twin));
        assert!(!entry.withdraw_waiter(&twin));
        assert_eq!(entry.waiter_count(), 1);

        let withdrawn = [one.try_take(), two.try_take()]
            .into_iter()
            .flatten()
            .filter(|r| matches!(r, Err(SchedulerError::DemandWithdrawn)))
            .count();
        assert_eq!(withdrawn, 1);
    }
}
