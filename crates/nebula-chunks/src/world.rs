//! The world host: owns a [`Scheduler`] and the fixed-rate tick thread driving it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nebula_config::ChunkSystemConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chunk::ChunkPayload;
use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::stage_chain::StageChain;

/// Ticks longer than this many intervals are reported as overruns.
const OVERRUN_FACTOR: u32 = 4;

/// Immutable description of a world, handed to every task invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldInfo {
    /// Human-readable world name.
    pub name: String,
    /// Seed for deterministic generation.
    pub seed: u64,
}

impl WorldInfo {
    /// Creates a world description.
    pub fn new(name: impl Into<String>, seed: u64) -> Self {
        Self {
            name: name.into(),
            seed,
        }
    }
}

struct TickLoop {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// A world with its chunk scheduler.
///
/// Creating the world seals its stage chain. [`start`](World::start) spawns
/// the `chunk-tick` thread; it is joined by [`stop`](World::stop) or on drop.
pub struct World<D: ChunkPayload> {
    scheduler: Arc<Scheduler<D>>,
    tick_interval: Duration,
    tick_loop: Option<TickLoop>,
}

impl<D: ChunkPayload> World<D> {
    /// Activates a world: validates `config`, seals `chain` and starts the
    /// task workers. The tick thread is not started yet.
    pub fn new(
        info: WorldInfo,
        chain: StageChain<D>,
        config: ChunkSystemConfig,
    ) -> Result<Self, SchedulerError> {
        let tick_interval = config.tick_interval();
        let scheduler = Arc::new(Scheduler::new(info, chain, config)?);
        Ok(Self {
            scheduler,
            tick_interval,
            tick_loop: None,
        })
    }

    /// The world's scheduler; clone the `Arc` to submit from other threads.
    pub fn scheduler(&self) -> &Arc<Scheduler<D>> {
        &self.scheduler
    }

    /// The world description.
    pub fn info(&self) -> &WorldInfo {
        self.scheduler.world()
    }

    /// Returns `true` while the tick thread runs.
    pub fn is_running(&self) -> bool {
        self.tick_loop.is_some()
    }

    /// Spawns the tick thread. Does nothing if it already runs.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.tick_loop.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let scheduler = Arc::clone(&self.scheduler);
        let interval = self.tick_interval;
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("chunk-tick".into())
            .spawn(move || run_tick_loop(&scheduler, interval, &flag))
            .map_err(|e| SchedulerError::Runtime(Arc::new(e)))?;

        info!(
            world = %self.scheduler.world().name,
            interval_ms = interval.as_millis() as u64,
            "chunk tick thread started"
        );
        self.tick_loop = Some(TickLoop { running, thread });
        Ok(())
    }

    /// Stops and joins the tick thread. Pending futures stay pending until the
    /// world is dropped.
    pub fn stop(&mut self) {
        let Some(tick_loop) = self.tick_loop.take() else {
            return;
        };
        tick_loop.running.store(false, Ordering::Release);
        if tick_loop.thread.join().is_err() {
            warn!("chunk tick thread panicked");
        }
        info!(
            world = %self.scheduler.world().name,
            tick = self.scheduler.current_tick(),
            "chunk tick thread stopped"
        );
    }
}

impl<D: ChunkPayload> Drop for World<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tick_loop<D: ChunkPayload>(scheduler: &Scheduler<D>, interval: Duration, running: &AtomicBool) {
    let mut next = Instant::now();
    while running.load(Ordering::Acquire) {
        let started = Instant::now();
        {
            let span = tracing::debug_span!("tick", tick = scheduler.current_tick());
            let _enter = span.enter();
            scheduler.tick();
        }
        let elapsed = started.elapsed();
        if elapsed > interval * OVERRUN_FACTOR {
            warn!(
                "Tick took {:.1}ms, budget is {:.1}ms",
                elapsed.as_secs_f64() * 1000.0,
                interval.as_secs_f64() * 1000.0
            );
        }

        next += interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            // Behind schedule: skip the missed ticks instead of bursting.
            next = now;
        }
    }
}
