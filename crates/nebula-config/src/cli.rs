//! Command-line argument parsing for the chunk server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Chunk server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "nebula-chunkd", about = "Nebula chunk server")]
pub struct CliArgs {
    /// World tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Worker threads for load/generation tasks.
    #[arg(long)]
    pub worker_threads: Option<usize>,

    /// Side length of generation batches, in cells.
    #[arg(long)]
    pub batch_span: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// The config directory to use: `--config` if given, the platform default otherwise.
    pub fn config_dir(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Config::default_dir)
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.chunks.tick_rate_hz = rate;
        }
        if let Some(threads) = args.worker_threads {
            self.chunks.worker_threads = threads;
        }
        if let Some(span) = args.batch_span {
            self.chunks.generation_batch_span = span;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
