//! The per-world chunk scheduler.
//!
//! Callers on any thread submit and remove demands; the tick thread calls
//! [`Scheduler::tick`] at a fixed rate to age demands, commit finished tasks,
//! start the next pipeline step of every cell below its target, and evict
//! cells nobody needs any more.
//!
//! Per cell, stage advancement is strictly sequential: the step for position
//! `i + 1` is only dispatched once the result for position `i` has been
//! committed on the tick thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nebula_config::ChunkSystemConfig;
use tracing::{debug, error, trace, warn};

use crate::cell::PipelineState;
use crate::chunk::{CellPos, Chunk, ChunkPayload};
use crate::demand::{ChunkFuture, Demand, DemandFuture, DemandSpec, MAX_DEMAND_LEVEL};
use crate::error::{SchedulerError, StageChainError, TaskError};
use crate::events::{ChunkEvent, ChunkEventBuffer};
use crate::index::CellIndex;
use crate::pipeline::{Completion, Pipeline};
use crate::stage_chain::{StageChain, StageId};
use crate::task::{GenerationBatch, LoadOutcome, StageInfo};
use crate::world::WorldInfo;

/// What a single [`Scheduler::tick`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Demands whose lifetime ran out.
    pub expired: usize,
    /// Stage commits, one per cell.
    pub committed: usize,
    /// Load tasks started.
    pub loads_dispatched: usize,
    /// Generation invocations started, one per batch.
    pub generations_dispatched: usize,
    /// Task failures recorded, one per cell.
    pub failed: usize,
    /// Cells dropped from the scheduler.
    pub evicted: usize,
}

/// Orchestrates demands and stage tasks for one world.
pub struct Scheduler<D: ChunkPayload> {
    chain: StageChain<D>,
    config: ChunkSystemConfig,
    world: Arc<WorldInfo>,
    index: CellIndex<D>,
    pipeline: Pipeline,
    tick: AtomicU64,
    events: Mutex<ChunkEventBuffer>,
}

impl<D: ChunkPayload> Scheduler<D> {
    /// Creates a scheduler, sealing `chain` and starting the task workers.
    ///
    /// Fails if the chain has no stage or the configuration is invalid.
    pub fn new(
        world: WorldInfo,
        mut chain: StageChain<D>,
        config: ChunkSystemConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        if !chain.is_valid() {
            return Err(StageChainError::Empty.into());
        }
        chain.finish_setup();

        let world = Arc::new(world);
        let workers = config.resolved_worker_threads(num_cpus::get());
        let pipeline = Pipeline::new(workers, Arc::clone(&world))?;
        debug!(
            world = %world.name,
            stages = chain.len(),
            workers,
            "chunk scheduler started"
        );

        Ok(Self {
            chain,
            config,
            world,
            index: CellIndex::new(),
            pipeline,
            tick: AtomicU64::new(0),
            events: Mutex::new(ChunkEventBuffer::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Requests that the cell at `(x, z)` and every cell within `level` of it
    /// reach `stage`.
    ///
    /// `ticks_to_live` counts down once the cell has reached `stage`, or while
    /// the cell sits on a failed step; 0 keeps the demand until
    /// [`remove_demand`](Self::remove_demand). `level` is at most
    /// [`MAX_DEMAND_LEVEL`]. The future resolves with the chunk and the
    /// recorded demand.
    pub fn submit_demand(
        &self,
        x: i32,
        z: i32,
        stage: StageId,
        level: u32,
        ticks_to_live: i32,
    ) -> Result<DemandFuture<D>, SchedulerError> {
        let ticks_to_live = u32::try_from(ticks_to_live)
            .map_err(|_| SchedulerError::InvalidArgument("ticks_to_live must not be negative"))?;
        if level > MAX_DEMAND_LEVEL {
            return Err(SchedulerError::InvalidArgument("level exceeds MAX_DEMAND_LEVEL"));
        }
        let position = self.chain.position(stage)?;
        let origin = CellPos::new(x, z);
        let demand = Demand::new(stage, level, ticks_to_live, self.current_tick());
        let (tx, future) = DemandFuture::channel(demand);

        let mut tx = Some(tx);
        self.index.update(origin, |entry| {
            entry.ledger.add_local(demand, position);
            if let Some(tx) = tx.take() {
                entry.add_waiter(demand, position, tx);
            }
        });
        for pos in origin.square(level).filter(|&p| p != origin) {
            self.index.update(pos, |entry| {
                entry.ledger.add_propagated(origin, demand, position);
            });
        }
        trace!(%origin, level, ticks_to_live, position, "demand submitted");
        Ok(future)
    }

    /// Submits a demand built from a template.
    pub fn submit_spec(
        &self,
        x: i32,
        z: i32,
        spec: &DemandSpec,
    ) -> Result<DemandFuture<D>, SchedulerError> {
        self.submit_demand(x, z, spec.stage, spec.level, spec.ticks_to_live)
    }

    /// Submits a demand for the chain's last stage.
    pub fn submit_full(
        &self,
        x: i32,
        z: i32,
        level: u32,
        ticks_to_live: i32,
    ) -> Result<DemandFuture<D>, SchedulerError> {
        self.submit_demand(x, z, self.last_stage()?, level, ticks_to_live)
    }

    /// Resolves to the fully advanced chunk at `(x, z)`.
    ///
    /// Places a single-cell demand for the last stage that lives for one tick
    /// after it is satisfied.
    pub fn chunk_at(&self, x: i32, z: i32) -> Result<ChunkFuture<D>, SchedulerError> {
        self.submit_demand(x, z, self.last_stage()?, 0, 1)
            .map(ChunkFuture::new)
    }

    /// Removes one instance of `demand` placed at `(x, z)`, along with its
    /// propagated copies.
    ///
    /// Applied immediately rather than on the next tick, so the result is
    /// returned directly instead of through a future. Returns `false` if no
    /// such demand is placed there. A future still waiting for the removed
    /// instance completes with [`SchedulerError::DemandWithdrawn`]. Tasks
    /// already in flight are not cancelled.
    pub fn remove_demand(&self, x: i32, z: i32, demand: &Demand) -> bool {
        let origin = CellPos::new(x, z);
        let removed = self
            .index
            .update_existing(origin, |entry| {
                let change = entry.ledger.remove_local(demand)?;
                entry.withdraw_waiter(demand);
                Some(change)
            })
            .flatten();
        let Some(change) = removed else {
            return false;
        };
        self.withdraw_propagated(origin, demand);
        trace!(%origin, lowered = change.lowered(), "demand removed");
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Highest stage the cell has fully reached.
    pub fn cursor(&self, x: i32, z: i32) -> Option<StageId> {
        self.index
            .update_existing(CellPos::new(x, z), |entry| entry.cursor())
            .flatten()
            .and_then(|position| self.chain.stage_at(position))
    }

    /// Highest stage any covering demand requires of the cell.
    pub fn target(&self, x: i32, z: i32) -> Option<StageId> {
        self.index
            .update_existing(CellPos::new(x, z), |entry| entry.ledger.target())
            .flatten()
            .and_then(|position| self.chain.stage_at(position))
    }

    /// Returns `true` if the cell has fully reached `stage` or a later one.
    pub fn is_at_least(&self, x: i32, z: i32, stage: StageId) -> Result<bool, SchedulerError> {
        let position = self.chain.position(stage)?;
        let cursor = self
            .index
            .update_existing(CellPos::new(x, z), |entry| entry.cursor())
            .flatten();
        Ok(cursor >= Some(position))
    }

    /// The chunk handle of a tracked cell.
    pub fn chunk(&self, x: i32, z: i32) -> Option<Arc<Chunk<D>>> {
        self.index
            .update_existing(CellPos::new(x, z), |entry| Arc::clone(entry.chunk()))
    }

    /// Number of cells currently tracked.
    pub fn tracked_cells(&self) -> usize {
        self.index.len()
    }

    /// Number of completed [`tick`](Self::tick) calls.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// The sealed stage chain.
    pub fn stage_chain(&self) -> &StageChain<D> {
        &self.chain
    }

    /// The world handed to every task.
    pub fn world(&self) -> &Arc<WorldInfo> {
        &self.world
    }

    /// Tasks dispatched but not yet reported back.
    pub fn in_flight(&self) -> u64 {
        self.pipeline.in_flight()
    }

    /// Events of the previous and the current tick.
    pub fn read_events(&self) -> Vec<ChunkEvent> {
        self.events().read().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Runs one evaluation pass. Must only be called from one thread at a time.
    pub fn tick(&self) -> TickReport {
        let now = self.current_tick();
        let mut report = TickReport::default();

        self.events().swap();
        self.decay_demands(&mut report);
        for completion in self.pipeline.drain() {
            match completion {
                Completion::Load {
                    pos,
                    stage,
                    position,
                    result,
                } => self.finish_load(pos, &stage, position, result, now, &mut report),
                Completion::Generation {
                    cells,
                    stage,
                    position,
                    result,
                } => self.finish_generation(cells, &stage, position, result, now, &mut report),
            }
        }
        self.dispatch_loads(now, &mut report);
        self.dispatch_generations(&mut report);
        self.evict_idle(&mut report);

        self.tick.fetch_add(1, Ordering::AcqRel);
        if report != TickReport::default() {
            trace!(tick = now, ?report, "tick finished");
        }
        report
    }

    fn decay_demands(&self, report: &mut TickReport) {
        for cell in self.index.snapshot() {
            let (origin, expired) = {
                let Some(mut entry) = cell.lock() else {
                    continue;
                };
                if entry.ledger.local_count() == 0 {
                    continue;
                }
                let (cursor, failed) = (entry.cursor(), entry.is_failed());
                let (expired, _) = entry.ledger.decay(cursor, failed);
                (entry.pos(), expired)
            };
            for demand in expired {
                self.withdraw_propagated(origin, &demand);
                trace!(%origin, "demand expired");
                report.expired += 1;
            }
        }
    }

    fn finish_load(
        &self,
        pos: CellPos,
        stage: &StageInfo,
        position: usize,
        result: Result<LoadOutcome, TaskError>,
        now: u64,
        report: &mut TickReport,
    ) {
        match result {
            Ok(LoadOutcome::Loaded) => {
                if self.commit(pos, stage, position) {
                    report.committed += 1;
                }
            }
            Ok(LoadOutcome::Missing) => {
                self.index.update_existing(pos, |entry| {
                    if matches!(entry.pipeline, PipelineState::Loading(p) if p == position) {
                        entry.pipeline = PipelineState::AwaitingGeneration(position);
                    }
                });
            }
            Err(err) => {
                self.fail(pos, stage, position, err, now);
                report.failed += 1;
            }
        }
    }

    fn finish_generation(
        &self,
        cells: Vec<CellPos>,
        stage: &StageInfo,
        position: usize,
        result: Result<(), TaskError>,
        now: u64,
        report: &mut TickReport,
    ) {
        match result {
            Ok(()) => {
                for &pos in &cells {
                    if self.commit(pos, stage, position) {
                        report.committed += 1;
                    }
                }
                self.events().send(ChunkEvent::Generated {
                    cells,
                    stage: stage.id,
                });
            }
            Err(err) => {
                for pos in cells {
                    self.fail(pos, stage, position, err.clone(), now);
                    report.failed += 1;
                }
            }
        }
    }

    /// Commits `position` for a cell whose step for it is still in flight.
    fn commit(&self, pos: CellPos, stage: &StageInfo, position: usize) -> bool {
        let resolved = self
            .index
            .update_existing(pos, |entry| {
                let in_flight = matches!(
                    entry.pipeline,
                    PipelineState::Loading(p) | PipelineState::Generating(p) if p == position
                );
                in_flight.then(|| entry.commit(position))
            })
            .flatten();
        let Some(resolved) = resolved else {
            return false;
        };
        debug!(%pos, stage = %stage.key, resolved, "stage reached");
        self.events().send(ChunkEvent::StageReached {
            pos,
            stage: stage.id,
        });
        true
    }

    fn fail(&self, pos: CellPos, stage: &StageInfo, position: usize, err: TaskError, now: u64) {
        let fatal = err.is_fatal();
        if fatal {
            error!(%pos, stage = %stage.key, error = %err, "chunk task failed fatally");
        } else {
            warn!(%pos, stage = %stage.key, error = %err, "chunk task failed, retrying");
        }
        let failure = SchedulerError::TaskFailed {
            pos,
            stage: stage.key.clone(),
            source: err,
        };
        let retry_at = (!fatal).then_some(now + 1);
        self.index
            .update_existing(pos, |entry| entry.fail(position, retry_at, failure));
        self.events().send(ChunkEvent::Failed {
            pos,
            stage: stage.id,
            fatal,
        });
    }

    fn dispatch_loads(&self, now: u64, report: &mut TickReport) {
        let mut budget = self.config.dispatches_per_tick;
        for cell in self.index.snapshot() {
            if budget == 0 {
                break;
            }
            let (chunk, stage, task, position) = {
                let Some(mut entry) = cell.lock() else {
                    continue;
                };
                let Some(position) = entry.next_step(now) else {
                    continue;
                };
                let Some((stage, task)) = self.stage_info(position).and_then(|stage| {
                    let task = Arc::clone(self.chain.load_task(stage.id).ok()?);
                    Some((stage, task))
                }) else {
                    continue;
                };
                entry.pipeline = PipelineState::Loading(position);
                (Arc::clone(entry.chunk()), stage, task, position)
            };
            trace!(pos = %chunk.pos(), stage = %stage.key, "load dispatched");
            self.pipeline.dispatch_load(task, chunk, stage, position);
            budget -= 1;
            report.loads_dispatched += 1;
        }
    }

    /// Groups cells awaiting generation by stage and batch region, and starts
    /// one generation per group, at most `dispatches_per_tick` groups per tick.
    fn dispatch_generations(&self, report: &mut TickReport) {
        let span = self.config.generation_batch_span;
        let mut batches: BTreeMap<(usize, (i32, i32)), Vec<Arc<Chunk<D>>>> = BTreeMap::new();
        for cell in self.index.snapshot() {
            let Some(mut entry) = cell.lock() else {
                continue;
            };
            let PipelineState::AwaitingGeneration(position) = entry.pipeline else {
                continue;
            };
            if entry.ledger.target() < Some(position) {
                // Demand withdrawn while loading: drop the step.
                entry.pipeline = PipelineState::Idle;
                continue;
            }
            let chunk = Arc::clone(entry.chunk());
            batches
                .entry((position, entry.pos().region(span)))
                .or_default()
                .push(chunk);
        }

        let budget = self.config.dispatches_per_tick as usize;
        for ((position, region), chunks) in batches.into_iter().take(budget) {
            let Some((stage, task)) = self.stage_info(position).and_then(|stage| {
                let task = Arc::clone(self.chain.generation_task(stage.id).ok()?);
                Some((stage, task))
            }) else {
                continue;
            };
            // Batches over budget stay awaiting; claim the cells of this one.
            let chunks: Vec<_> = chunks
                .into_iter()
                .filter(|chunk| {
                    self.index
                        .update_existing(chunk.pos(), |entry| {
                            let waiting = matches!(
                                entry.pipeline,
                                PipelineState::AwaitingGeneration(p) if p == position
                            );
                            if waiting {
                                entry.pipeline = PipelineState::Generating(position);
                            }
                            waiting
                        })
                        .unwrap_or(false)
                })
                .collect();
            if chunks.is_empty() {
                continue;
            }
            trace!(?region, cells = chunks.len(), stage = %stage.key, "generation dispatched");
            self.pipeline
                .dispatch_generation(task, GenerationBatch::new(chunks), stage, position);
            report.generations_dispatched += 1;
        }
    }

    fn evict_idle(&self, report: &mut TickReport) {
        let mut budget = self.config.evictions_per_tick;
        for cell in self.index.snapshot() {
            if budget == 0 {
                break;
            }
            let pos = match cell.lock() {
                Some(entry) if entry.is_evictable() => entry.pos(),
                _ => continue,
            };
            if self.index.evict_if(pos, |entry| entry.is_evictable()) {
                debug!(%pos, "chunk evicted");
                self.events().send(ChunkEvent::Evicted { pos });
                budget -= 1;
                report.evicted += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn withdraw_propagated(&self, origin: CellPos, demand: &Demand) {
        for pos in origin.square(demand.level()).filter(|&p| p != origin) {
            self.index.update_existing(pos, |entry| {
                entry.ledger.remove_propagated(origin, demand);
            });
        }
    }

    fn last_stage(&self) -> Result<StageId, SchedulerError> {
        self.chain
            .last()
            .ok_or(SchedulerError::Stage(StageChainError::Empty))
    }

    fn stage_info(&self, position: usize) -> Option<StageInfo> {
        let id = self.chain.stage_at(position)?;
        let key = self.chain.key(id).ok()?.clone();
        Some(StageInfo { id, key })
    }

    fn events(&self) -> MutexGuard<'_, ChunkEventBuffer> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
