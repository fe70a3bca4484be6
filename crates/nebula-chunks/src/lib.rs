//! Ticket-based chunk scheduling: an extensible stage chain, expiring demands
//! that propagate over square regions, and an asynchronous load/generate
//! pipeline driven by a fixed-rate tick.

mod cell;
pub mod chunk;
pub mod demand;
pub mod error;
pub mod events;
mod index;
pub mod key;
pub mod ledger;
mod pipeline;
pub mod scheduler;
pub mod stage_chain;
pub mod task;
pub mod world;

pub use chunk::{CellPos, Chunk, ChunkPayload};
pub use demand::{
    ChunkAndDemand, ChunkFuture, Demand, DemandFuture, DemandSpec, MAX_DEMAND_LEVEL,
};
pub use error::{SchedulerError, StageChainError, TaskError, TaskFailureKind};
pub use events::{ChunkEvent, ChunkEventBuffer};
pub use key::{DEFAULT_NAMESPACE, KeyError, NamespaceKey};
pub use ledger::{DemandLedger, TargetChange};
pub use scheduler::{Scheduler, TickReport};
pub use stage_chain::{ChainId, StageChain, StageId};
pub use task::{
    ChunkGenerationTask, ChunkLoadTask, EmptyGenerationTask, EmptyLoadTask, GenerationBatch,
    GenerationContext, LoadContext, LoadOutcome, StageInfo, TaskExecutor,
};
pub use world::{World, WorldInfo};
