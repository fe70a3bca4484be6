//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level chunk server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Chunk scheduler settings.
    pub chunks: ChunkSystemConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Chunk scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkSystemConfig {
    /// Rate of the world tick thread (Hz).
    pub tick_rate_hz: u32,
    /// Worker threads for load/generation tasks (0 = derive from CPU count).
    pub worker_threads: usize,
    /// Maximum number of load tasks started per tick; generation batches are
    /// capped separately by the same number.
    pub dispatches_per_tick: u32,
    /// Maximum number of idle cells evicted per tick.
    pub evictions_per_tick: u32,
    /// Side length, in cells, of the square regions whose cells are generated
    /// together. 1 disables batching.
    pub generation_batch_span: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ChunkSystemConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            worker_threads: 0,
            dispatches_per_tick: 64,
            evictions_per_tick: 32,
            generation_batch_span: 1,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ChunkSystemConfig {
    /// Checks that every value is usable by the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "chunks.tick_rate_hz",
                reason: "must be at least 1",
            });
        }
        if self.generation_batch_span == 0 {
            return Err(ConfigError::Invalid {
                field: "chunks.generation_batch_span",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Number of worker threads to spawn, resolving `0` from the CPU count.
    ///
    /// Leaves headroom for the tick thread and whoever submits demands.
    pub fn resolved_worker_threads(&self, cpus: usize) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            cpus.max(2).saturating_sub(2).max(1)
        }
    }

    /// Duration of a single tick at the configured rate.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the chunk server (`<config_dir>/nebula/chunks`).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nebula").join("chunks"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.chunks.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.chunks.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("tick_rate_hz: 20"));
        assert!(ron_str.contains("generation_batch_span: 1"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.chunks.worker_threads = 3;
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(chunks: (tick_rate_hz: 40))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.chunks.tick_rate_hz, 40);
        assert_eq!(config.chunks.evictions_per_tick, 32);
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_tick_rate() {
        let mut config = ChunkSystemConfig::default();
        config.tick_rate_hz = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "chunks.tick_rate_hz",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_batch_span() {
        let mut config = ChunkSystemConfig::default();
        config.generation_batch_span = 0;
        assert!(config.validate().is_err());
        config.generation_batch_span = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolved_worker_threads() {
        let mut config = ChunkSystemConfig::default();
        assert_eq!(config.resolved_worker_threads(8), 6);
        assert_eq!(config.resolved_worker_threads(2), 1);
        assert_eq!(config.resolved_worker_threads(1), 1);
        config.worker_threads = 3;
        assert_eq!(config.resolved_worker_threads(64), 3);
    }

    #[test]
    fn test_tick_interval() {
        let config = ChunkSystemConfig::default();
        assert_eq!(config.tick_interval(), std::time::Duration::from_millis(50));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.chunks.dispatches_per_tick = 7;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.ron"),
            "(chunks: (generation_batch_span: 0))",
        )
        .unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.chunks.tick_rate_hz = 10;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.unwrap().chunks.tick_rate_hz, 10);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
