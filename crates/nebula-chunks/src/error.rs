//! Error types for the chunk system.

use std::sync::Arc;

use thiserror::Error;

use crate::chunk::CellPos;
use crate::key::NamespaceKey;

/// Structural errors raised by a [`StageChain`](crate::StageChain).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageChainError {
    /// A stage with the same key is already registered.
    #[error("duplicate stage key: {0}")]
    DuplicateKey(NamespaceKey),
    /// The chain has been sealed by a running world and can no longer change.
    #[error("stage chain is sealed")]
    Sealed,
    /// The handle refers to a stage that has been removed.
    #[error("stage has been removed from its chain")]
    StageRemoved,
    /// The handle belongs to a different chain.
    #[error("stage belongs to a different chain")]
    ForeignStage,
    /// The chain holds no stage.
    #[error("stage chain is empty")]
    Empty,
}

/// How a failed task should be treated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailureKind {
    /// The cell is retried on a later tick while it still has demand.
    Transient,
    /// The cell is parked as failed until it is evicted.
    Fatal,
}

/// Failure reported by a load or generation task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} task failure: {message}")]
pub struct TaskError {
    /// Retry classification.
    pub kind: TaskFailureKind,
    /// Human-readable cause.
    pub message: String,
}

impl TaskError {
    /// A failure worth retrying on a later tick.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TaskFailureKind::Transient,
            message: message.into(),
        }
    }

    /// A failure that parks the cell until it is evicted.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TaskFailureKind::Fatal,
            message: message.into(),
        }
    }

    /// Returns `true` for [`TaskFailureKind::Fatal`].
    pub fn is_fatal(&self) -> bool {
        self.kind == TaskFailureKind::Fatal
    }
}

/// Errors surfaced by the [`Scheduler`](crate::Scheduler) and its futures.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The stage handle is unusable with this scheduler's chain.
    #[error(transparent)]
    Stage(#[from] StageChainError),
    /// A pipeline task failed while advancing the cell.
    #[error("task for stage {stage} failed at cell {pos}: {source}")]
    TaskFailed {
        /// The cell being advanced.
        pos: CellPos,
        /// Key of the stage whose task failed.
        stage: NamespaceKey,
        /// The task's own error.
        #[source]
        source: TaskError,
    },
    /// The demand was removed or expired before the cell reached its stage.
    #[error("demand withdrawn before it was satisfied")]
    DemandWithdrawn,
    /// The scheduler was dropped while the future was pending.
    #[error("chunk scheduler shut down")]
    Shutdown,
    /// The task worker pool or the tick thread could not be started.
    #[error("failed to start chunk threads: {0}")]
    Runtime(Arc<std::io::Error>),
    /// The chunk system configuration was rejected.
    #[error("invalid chunk configuration: {0}")]
    Config(Arc<nebula_config::ConfigError>),
}

impl From<nebula_config::ConfigError> for SchedulerError {
    fn from(err: nebula_config::ConfigError) -> Self {
        Self::Config(Arc::new(err))
    }
}
