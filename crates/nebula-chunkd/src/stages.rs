//! The stage chain served by the daemon: terrain, features, full.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use nebula_chunks::{
    ChunkGenerationTask, EmptyGenerationTask, EmptyLoadTask, GenerationContext, NamespaceKey,
    StageChain, TaskError,
};

use crate::DaemonError;

/// Columns at or below this height are under water and get no trees.
pub const SEA_LEVEL: i32 = 64;

/// Per-cell payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Column {
    /// Surface height.
    pub height: i32,
    /// Trees placed by the features stage.
    pub trees: u32,
}

/// Builds the unsealed stage chain; [`nebula_chunks::World::new`] seals it.
pub fn build_chain() -> Result<StageChain<Column>, DaemonError> {
    let mut chain = StageChain::new();
    chain.create_last(
        NamespaceKey::nebula("terrain")?,
        Arc::new(EmptyLoadTask),
        Arc::new(TerrainGeneration),
    )?;
    chain.create_last(
        NamespaceKey::nebula("features")?,
        Arc::new(EmptyLoadTask),
        Arc::new(FeatureGeneration),
    )?;
    chain.create_last(
        NamespaceKey::nebula("full")?,
        Arc::new(EmptyLoadTask),
        Arc::new(EmptyGenerationTask),
    )?;
    Ok(chain)
}

/// Derives a per-column seed from the world seed and cell coordinates.
pub fn column_seed(world_seed: u64, x: i32, z: i32) -> u64 {
    let mut hasher = DefaultHasher::new();
    world_seed.hash(&mut hasher);
    x.hash(&mut hasher);
    z.hash(&mut hasher);
    hasher.finish()
}

/// Surface height of a column, stable for a given seed.
pub fn height_at(seed: u64, x: i32, z: i32) -> i32 {
    40 + (column_seed(seed, x, z) % 48) as i32
}

/// Fills the surface height of every cell in the batch.
pub struct TerrainGeneration;

#[async_trait]
impl ChunkGenerationTask<Column> for TerrainGeneration {
    async fn generate_chunk(&self, ctx: GenerationContext<Column>) -> Result<(), TaskError> {
        let seed = ctx.world.seed;
        let cells = ctx.batch.cells().to_vec();
        ctx.executor
            .spawn_blocking(move || {
                for chunk in &cells {
                    chunk.write().height = height_at(seed, chunk.x(), chunk.z());
                }
            })
            .await
    }
}

/// Places trees on dry land.
pub struct FeatureGeneration;

#[async_trait]
impl ChunkGenerationTask<Column> for FeatureGeneration {
    async fn generate_chunk(&self, ctx: GenerationContext<Column>) -> Result<(), TaskError> {
        for chunk in ctx.batch.cells() {
            let mut column = chunk.write();
            if column.height <= 0 {
                return Err(TaskError::transient(format!(
                    "terrain missing at {}",
                    chunk.pos()
                )));
            }
            column.trees = if column.height > SEA_LEVEL {
                (column_seed(ctx.world.seed, chunk.x(), chunk.z()).rotate_left(17) % 4) as u32
            } else {
                0
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order() {
        let chain = build_chain().unwrap();
        let paths: Vec<_> = chain
            .iter()
            .map(|stage| chain.key(stage).unwrap().path().to_string())
            .collect();
        assert_eq!(paths, vec!["terrain", "features", "full"]);
    }

    #[test]
    fn test_height_is_deterministic_and_bounded() {
        for (x, z) in [(0, 0), (-5, 12), (i32::MAX, i32::MIN)] {
            let h = height_at(99, x, z);
            assert_eq!(h, height_at(99, x, z));
            assert!((40..88).contains(&h));
        }
        let differs = (0..16).any(|x| height_at(1, x, 0) != height_at(2, x, 0));
        assert!(differs);
    }

    #[test]
    fn test_world_generates_columns() {
        let config = nebula_config::ChunkSystemConfig {
            tick_rate_hz: 200,
            worker_threads: 2,
            ..Default::default()
        };
        let mut world = nebula_chunks::World::new(
            nebula_chunks::WorldInfo::new("test", 11),
            build_chain().unwrap(),
            config,
        )
        .unwrap();
        world.start().unwrap();

        for (x, z) in [(0, 0), (3, -2), (-7, 5)] {
            let chunk = world.scheduler().chunk_at(x, z).unwrap().wait().unwrap();
            let column = chunk.read();
            assert_eq!(column.height, height_at(11, x, z));
            if column.height <= SEA_LEVEL {
                assert_eq!(column.trees, 0);
            }
            assert!(column.trees < 4);
        }
        world.stop();
    }
}
