use agent_config::ConfigError;
use agent_memory::MemoryError;
use thiserror::Error;

use crate::scheduler::SchedulerError;

/// Errors raised while assembling or operating the kernel.
///
/// Governed calls never produce these; their failures live in
/// [`PipelineResult`](crate::PipelineResult).
#[derive(Debug, Error)]
pub enum KernelError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The trace store could not be opened.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The scheduler refused the task.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Result alias for kernel assembly and operations.
pub type KernelResult<T> = Result<T, KernelError>;
