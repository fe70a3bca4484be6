//! Asynchronous execution of stage tasks.
//!
//! Tasks run on a tokio multi-thread runtime owned by the pipeline. Every
//! dispatched task reports back exactly once over a crossbeam channel, which
//! the tick thread drains; a panicking task is reported as a transient failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::runtime::Runtime;

use crate::chunk::{CellPos, Chunk, ChunkPayload};
use crate::error::{SchedulerError, TaskError};
use crate::task::{
    ChunkGenerationTask, ChunkLoadTask, GenerationBatch, GenerationContext, LoadContext,
    LoadOutcome, StageInfo, TaskExecutor,
};
use crate::world::WorldInfo;

/// A finished task, as seen by the tick thread.
#[derive(Debug)]
pub(crate) enum Completion {
    Load {
        pos: CellPos,
        stage: StageInfo,
        position: usize,
        result: Result<LoadOutcome, TaskError>,
    },
    Generation {
        cells: Vec<CellPos>,
        stage: StageInfo,
        position: usize,
        result: Result<(), TaskError>,
    },
}

pub(crate) struct Pipeline {
    /// Taken on drop so the runtime can be shut down without blocking.
    runtime: Option<Runtime>,
    executor: TaskExecutor,
    world: Arc<WorldInfo>,
    completion_sender: Sender<Completion>,
    completion_receiver: Receiver<Completion>,
    in_flight: Arc<AtomicU64>,
}

impl Pipeline {
    pub(crate) fn new(worker_threads: usize, world: Arc<WorldInfo>) -> Result<Self, SchedulerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("chunk-task-worker")
            .enable_time()
            .build()
            .map_err(|e| SchedulerError::Runtime(Arc::new(e)))?;
        let executor = TaskExecutor::new(runtime.handle().clone());
        let (completion_sender, completion_receiver) = unbounded();
        Ok(Self {
            runtime: Some(runtime),
            executor,
            world,
            completion_sender,
            completion_receiver,
            in_flight: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Starts the load task of `stage` for one cell.
    pub(crate) fn dispatch_load<D: ChunkPayload>(
        &self,
        task: Arc<dyn ChunkLoadTask<D>>,
        chunk: Arc<Chunk<D>>,
        stage: StageInfo,
        position: usize,
    ) {
        let pos = chunk.pos();
        let ctx = LoadContext {
            world: Arc::clone(&self.world),
            x: pos.x,
            z: pos.z,
            chunk,
            executor: self.executor.clone(),
            stage: stage.clone(),
        };
        let work = self
            .executor
            .handle()
            .spawn(async move { task.load_chunk(ctx).await });
        self.report(work, move |result| Completion::Load {
            pos,
            stage,
            position,
            result,
        });
    }

    /// Starts one generation invocation of `stage` for a whole batch.
    pub(crate) fn dispatch_generation<D: ChunkPayload>(
        &self,
        task: Arc<dyn ChunkGenerationTask<D>>,
        batch: GenerationBatch<D>,
        stage: StageInfo,
        position: usize,
    ) {
        let Some(anchor) = batch.cells().first().cloned() else {
            return;
        };
        let cells: Vec<CellPos> = batch.positions().collect();
        let ctx = GenerationContext {
            world: Arc::clone(&self.world),
            x: anchor.x(),
            z: anchor.z(),
            chunk: anchor,
            executor: self.executor.clone(),
            stage: stage.clone(),
            batch,
        };
        let work = self
            .executor
            .handle()
            .spawn(async move { task.generate_chunk(ctx).await });
        self.report(work, move |result| Completion::Generation {
            cells,
            stage,
            position,
            result,
        });
    }

    /// Every completion received so far.
    pub(crate) fn drain(&self) -> Vec<Completion> {
        self.completion_receiver.try_iter().collect()
    }

    /// Number of dispatched tasks that have not reported back yet.
    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Awaits `work` and sends its outcome to the tick thread.
    fn report<T: Send + 'static>(
        &self,
        work: tokio::task::JoinHandle<Result<T, TaskError>>,
        wrap: impl FnOnce(Result<T, TaskError>) -> Completion + Send + 'static,
    ) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let sender = self.completion_sender.clone();
        let in_flight = Arc::clone(&self.in_flight);
        self.executor.handle().spawn(async move {
            let result = work
                .await
                .unwrap_or_else(|e| Err(TaskError::transient(format!("task aborted: {e}"))));
            let _ = sender.send(wrap(result));
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
