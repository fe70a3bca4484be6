//! Demands ("tickets") that keep cells loaded, and the futures returned for them.
//!
//! A [`Demand`] never references the chunk it affects; the pairing is only
//! made transiently in [`ChunkAndDemand`] when a submission resolves.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::chunk::Chunk;
use crate::error::SchedulerError;
use crate::stage_chain::StageId;

/// Largest accepted demand level; a level-64 demand covers a 129x129 square.
pub const MAX_DEMAND_LEVEL: u32 = 64;

/// A request that a cell, and the cells within `level` of it, reach a stage.
///
/// Several equal demands may sit on the same cell; removal deletes one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Demand {
    stage: StageId,
    level: u32,
    ticks_to_live: u32,
    tick_added: u64,
}

impl Demand {
    pub(crate) fn new(stage: StageId, level: u32, ticks_to_live: u32, tick_added: u64) -> Self {
        Self {
            stage,
            level,
            ticks_to_live,
            tick_added,
        }
    }

    /// The stage required by this demand.
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Square radius: 0 is one cell, 1 is 3x3, 2 is 5x5, and so on.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Lifetime in ticks once satisfied; 0 lives until explicitly removed.
    pub fn ticks_to_live(&self) -> u32 {
        self.ticks_to_live
    }

    /// Tick at which the demand was submitted.
    pub fn tick_added(&self) -> u64 {
        self.tick_added
    }

    /// Returns `true` if the demand never expires on its own.
    pub fn is_permanent(&self) -> bool {
        self.ticks_to_live == 0
    }

    /// Orders two demands for the same stage by level.
    ///
    /// Demands for different stages are not comparable; doing so is a caller
    /// bug caught in debug builds.
    pub fn cmp_level(&self, other: &Demand) -> Ordering {
        debug_assert_eq!(
            self.stage, other.stage,
            "demands for different stages are not comparable"
        );
        self.level.cmp(&other.level)
    }
}

/// Reusable demand template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DemandSpec {
    /// Required stage.
    pub stage: StageId,
    /// Square radius.
    pub level: u32,
    /// Lifetime in ticks; negative values are rejected on submission.
    pub ticks_to_live: i32,
}

/// The chunk a demand resolved for, paired with that demand.
pub struct ChunkAndDemand<D> {
    /// The resolved chunk.
    pub chunk: Arc<Chunk<D>>,
    /// The demand that triggered the resolution.
    pub demand: Demand,
}

impl<D> Clone for ChunkAndDemand<D> {
    fn clone(&self) -> Self {
        Self {
            chunk: Arc::clone(&self.chunk),
            demand: self.demand,
        }
    }
}

impl<D> std::fmt::Debug for ChunkAndDemand<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAndDemand")
            .field("demand", &self.demand)
            .finish_non_exhaustive()
    }
}

pub(crate) type DemandResult<D> = Result<ChunkAndDemand<D>, SchedulerError>;
pub(crate) type DemandSender<D> = oneshot::Sender<DemandResult<D>>;

/// Resolves once the demand's cell reaches the demanded stage.
///
/// Completion happens on the tick thread; await it, poll it with
/// [`try_take`](Self::try_take), or block with [`wait`](Self::wait).
pub struct DemandFuture<D> {
    demand: Demand,
    rx: oneshot::Receiver<DemandResult<D>>,
}

impl<D> DemandFuture<D> {
    pub(crate) fn channel(demand: Demand) -> (DemandSender<D>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { demand, rx })
    }

    /// The demand this future was created for; needed to remove it again.
    pub fn demand(&self) -> Demand {
        self.demand
    }

    /// Returns the outcome if it is already available.
    pub fn try_take(&mut self) -> Option<DemandResult<D>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SchedulerError::Shutdown)),
        }
    }

    /// Blocks the current thread until the outcome is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> DemandResult<D> {
        self.rx.blocking_recv().unwrap_or(Err(SchedulerError::Shutdown))
    }
}

impl<D> Future for DemandFuture<D> {
    type Output = DemandResult<D>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SchedulerError::Shutdown)))
    }
}

/// Resolves to the chunk alone; see [`Scheduler::chunk_at`](crate::Scheduler::chunk_at).
pub struct ChunkFuture<D> {
    inner: DemandFuture<D>,
}

impl<D> ChunkFuture<D> {
    pub(crate) fn new(inner: DemandFuture<D>) -> Self {
        Self { inner }
    }

    /// The single-tick demand placed for this query.
    pub fn demand(&self) -> Demand {
        self.inner.demand()
    }

    /// Returns the chunk if it is already available.
    pub fn try_take(&mut self) -> Option<Result<Arc<Chunk<D>>, SchedulerError>> {
        self.inner.try_take().map(|r| r.map(|pair| pair.chunk))
    }

    /// Blocks the current thread until the chunk is available.
    pub fn wait(self) -> Result<Arc<Chunk<D>>, SchedulerError> {
        self.inner.wait().map(|pair| pair.chunk)
    }
}

impl<D> Future for ChunkFuture<D> {
    type Output = Result<Arc<Chunk<D>>, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|r| r.map(|pair| pair.chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CellPos;
    use crate::key::NamespaceKey;
    use crate::stage_chain::StageChain;
    use crate::task::{EmptyGenerationTask, EmptyLoadTask};

    fn stage() -> StageId {
        let mut chain: StageChain<()> = StageChain::new();
        chain
            .create_last(
                NamespaceKey::nebula("full").unwrap(),
                Arc::new(EmptyLoadTask),
                Arc::new(EmptyGenerationTask),
            )
            .unwrap()
    }

    #[test]
    fn test_equal_demands_are_equal_values() {
        let s = stage();
        assert_eq!(Demand::new(s, 2, 5, 10), Demand::new(s, 2, 5, 10));
        assert_ne!(Demand::new(s, 2, 5, 10), Demand::new(s, 2, 5, 11));
    }

    #[test]
    fn test_cmp_level_orders_by_level_only() {
        let s = stage();
        let small = Demand::new(s, 1, 100, 0);
        let big = Demand::new(s, 3, 1, 50);
        assert_eq!(small.cmp_level(&big), Ordering::Less);
        assert_eq!(big.cmp_level(&small), Ordering::Greater);
        assert_eq!(small.cmp_level(&Demand::new(s, 1, 0, 9)), Ordering::Equal);
    }

    #[test]
    fn test_permanent_demand() {
        let s = stage();
        assert!(Demand::new(s, 0, 0, 0).is_permanent());
        assert!(!Demand::new(s, 0, 1, 0).is_permanent());
    }

    #[test]
    fn test_future_try_take_and_shutdown() {
        let demand = Demand::new(stage(), 0, 0, 0);
        let (tx, mut fut) = DemandFuture::<()>::channel(demand);
        assert!(fut.try_take().is_none());
        drop(tx);
        assert!(matches!(fut.try_take(), Some(Err(SchedulerError::Shutdown))));
    }

    #[test]
    fn test_chunk_future_maps_to_chunk() {
        let demand = Demand::new(stage(), 0, 1, 0);
        let (tx, fut) = DemandFuture::<u8>::channel(demand);
        let chunk = Arc::new(Chunk::new(CellPos::new(3, 4)));
        tx.send(Ok(ChunkAndDemand {
            chunk: Arc::clone(&chunk),
            demand,
        }))
        .unwrap();
        let got = ChunkFuture::new(fut).wait().unwrap();
        assert!(Arc::ptr_eq(&got, &chunk));
    }
}
