//! Nebula chunk daemon.
//!
//! Loads `config.ron`, starts a world on the terrain/features/full stage chain
//! and brings the spawn area to the last stage, logging tick reports while it
//! waits. Run with: `cargo run -p nebula-chunkd -- --worker-threads 4`

mod stages;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nebula_chunks::{CellPos, KeyError, SchedulerError, StageChainError, World, WorldInfo};
use nebula_config::{CliArgs, Config};
use thiserror::Error;
use tracing::{error, info, warn};

/// Spawn area radius, in cells around the origin.
const SPAWN_RADIUS: u32 = 4;
const WORLD_SEED: u64 = 0x6e65_6275_6c61;

/// Errors that abort the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Stage(#[from] StageChainError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config_dir();
    let (mut config, load_error) = match &config_dir {
        Some(dir) => match Config::load_or_create(dir) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
        None => (Config::default(), None),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.map(|dir| dir.join("logs"));
    nebula_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));
    if let Some(e) = load_error {
        warn!("Using default config: {e}");
    }
    info!(
        "Chunks: {} Hz, {} workers, batch span {}",
        config.chunks.tick_rate_hz,
        config.chunks.resolved_worker_threads(num_cpus::get()),
        config.chunks.generation_batch_span
    );

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("chunk daemon failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<(), DaemonError> {
    let chain = stages::build_chain()?;
    let mut world = World::new(
        WorldInfo::new("overworld", WORLD_SEED),
        chain,
        config.chunks.clone(),
    )?;
    world.start()?;
    let scheduler = Arc::clone(world.scheduler());

    // Permanent spawn demand; the per-cell futures below observe its progress.
    let spawn = scheduler.submit_full(0, 0, SPAWN_RADIUS, 0)?;
    let spawn_demand = spawn.demand();
    let columns = CellPos::new(0, 0)
        .square(SPAWN_RADIUS)
        .map(|pos| scheduler.chunk_at(pos.x, pos.z))
        .collect::<Result<Vec<_>, _>>()?;
    spawn.wait()?;

    let mut trees = 0;
    let mut highest = i32::MIN;
    for future in columns {
        let chunk = future.wait()?;
        let column = chunk.read();
        trees += column.trees;
        highest = highest.max(column.height);
    }
    info!(
        cells = scheduler.tracked_cells(),
        tick = scheduler.current_tick(),
        trees,
        highest,
        "spawn area ready"
    );
    for event in scheduler.read_events() {
        tracing::debug!(?event, "chunk event");
    }

    scheduler.remove_demand(0, 0, &spawn_demand);
    world.stop();
    Ok(())
}
