//! Pluggable load and generation capabilities attached to every stage.
//!
//! A stage holds exactly one [`ChunkLoadTask`] and one [`ChunkGenerationTask`].
//! For each stage transition the scheduler runs the load task first; when it
//! reports [`LoadOutcome::Missing`], the generation task fills the cell instead.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::chunk::{CellPos, Chunk, ChunkPayload};
use crate::error::TaskError;
use crate::key::NamespaceKey;
use crate::stage_chain::StageId;
use crate::world::WorldInfo;

/// Result of a successful load task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Persisted data for the stage was applied to the cell.
    Loaded,
    /// Nothing is persisted for the stage; the generation task must run.
    Missing,
}

/// The stage a task is being run for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageInfo {
    /// Handle into the world's stage chain.
    pub id: StageId,
    /// Key the stage was registered under.
    pub key: NamespaceKey,
}

/// Hydrates a cell up to a stage from persisted data.
///
/// The cell may be only partially populated when this runs: tasks of the same
/// or later stages may still modify it afterwards.
#[async_trait]
pub trait ChunkLoadTask<D: ChunkPayload>: Send + Sync + 'static {
    /// Applies whatever persisted data exists for `ctx.stage`.
    async fn load_chunk(&self, ctx: LoadContext<D>) -> Result<LoadOutcome, TaskError>;
}

/// Fills data the load task could not supply.
#[async_trait]
pub trait ChunkGenerationTask<D: ChunkPayload>: Send + Sync + 'static {
    /// Generates `ctx.stage` for every cell of `ctx.batch` in one invocation.
    async fn generate_chunk(&self, ctx: GenerationContext<D>) -> Result<(), TaskError>;
}

/// Everything a load task receives.
pub struct LoadContext<D> {
    /// The world the cell belongs to.
    pub world: Arc<WorldInfo>,
    /// The cell being loaded.
    pub chunk: Arc<Chunk<D>>,
    /// Chunk-grid X coordinate.
    pub x: i32,
    /// Chunk-grid Z coordinate.
    pub z: i32,
    /// Pool for heavy work after I/O.
    pub executor: TaskExecutor,
    /// The stage being loaded.
    pub stage: StageInfo,
}

/// Everything a generation task receives.
pub struct GenerationContext<D> {
    /// The world the cells belong to.
    pub world: Arc<WorldInfo>,
    /// The batch's anchor cell (the lowest position in the batch).
    pub chunk: Arc<Chunk<D>>,
    /// Anchor chunk-grid X coordinate.
    pub x: i32,
    /// Anchor chunk-grid Z coordinate.
    pub z: i32,
    /// Pool for heavy generation work.
    pub executor: TaskExecutor,
    /// The stage being generated.
    pub stage: StageInfo,
    /// Every cell generated by this invocation, anchor included.
    pub batch: GenerationBatch<D>,
}

/// A set of adjacent cells generated together, all sitting at the same stage.
pub struct GenerationBatch<D> {
    cells: Vec<Arc<Chunk<D>>>,
}

impl<D: ChunkPayload> GenerationBatch<D> {
    pub(crate) fn new(mut cells: Vec<Arc<Chunk<D>>>) -> Self {
        cells.sort_by_key(|c| c.pos());
        Self { cells }
    }

    /// Cells of the batch, sorted by position.
    pub fn cells(&self) -> &[Arc<Chunk<D>>] {
        &self.cells
    }

    /// Positions of the batch, sorted.
    pub fn positions(&self) -> impl Iterator<Item = CellPos> + '_ {
        self.cells.iter().map(|c| c.pos())
    }

    /// The cell at `pos`, if it is part of the batch.
    pub fn get(&self, pos: CellPos) -> Option<&Arc<Chunk<D>>> {
        self.cells
            .binary_search_by_key(&pos, |c| c.pos())
            .ok()
            .map(|i| &self.cells[i])
    }

    /// Number of cells in the batch.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always `false` for batches built by the scheduler.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Handle to the worker pool, passed to every task invocation.
#[derive(Clone, Debug)]
pub struct TaskExecutor {
    handle: Handle,
}

impl TaskExecutor {
    pub(crate) fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Runs CPU-heavy work on the blocking pool.
    ///
    /// A panic inside `f` is reported as a transient [`TaskError`].
    pub fn spawn_blocking<F, R>(&self, f: F) -> impl Future<Output = Result<R, TaskError>> + Send
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let join = self.handle.spawn_blocking(f);
        async move {
            join.await
                .map_err(|e| TaskError::transient(format!("blocking job failed: {e}")))
        }
    }

    /// Runs a future on the worker pool.
    pub fn spawn<F>(&self, future: F) -> impl Future<Output = Result<F::Output, TaskError>> + Send
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let join = self.handle.spawn(future);
        async move {
            join.await
                .map_err(|e| TaskError::transient(format!("async job failed: {e}")))
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Load task for stages without persisted data; always reports [`LoadOutcome::Missing`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyLoadTask;

#[async_trait]
impl<D: ChunkPayload> ChunkLoadTask<D> for EmptyLoadTask {
    async fn load_chunk(&self, _ctx: LoadContext<D>) -> Result<LoadOutcome, TaskError> {
        Ok(LoadOutcome::Missing)
    }
}

/// Generation task that leaves the cell untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyGenerationTask;

#[async_trait]
impl<D: ChunkPayload> ChunkGenerationTask<D> for EmptyGenerationTask {
    async fn generate_chunk(&self, _ctx: GenerationContext<D>) -> Result<(), TaskError> {
        Ok(())
    }
}
