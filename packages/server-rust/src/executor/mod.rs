//! Operation executor: partition threads, generic pool and ad-hoc runners.
//!
//! Every partition is owned by exactly one partition thread, which is the only
//! thread that ever runs operations against that partition. Generic work runs
//! on a small pool of generic threads. Each thread drains its own two-lane
//! queue, urgent lane first.

pub mod config;
pub mod lifecycle;
pub mod monitor;
pub mod operation_executor;
pub(crate) mod queue;
pub mod runner;
pub mod task;
pub mod thread;

pub use config::ExecutorConfig;
pub use lifecycle::ExecutorState;
pub use monitor::{BackgroundRunnable, BackgroundWorker, MonitorCommand, SlowOperationDetector};
pub use operation_executor::{ExecutorServices, OperationExecutor};
pub use queue::Lane;
pub use runner::{CurrentTask, OperationRunner, RunnerKind, RunnerSnapshot};
pub use task::Task;
pub use thread::{current_role, mark_operation_hostile, ThreadRole};

/// Errors surfaced synchronously by the executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
    #[error("{lane} lane full, work for partition {partition_id:?} rejected")]
    Rejected {
        lane: Lane,
        partition_id: Option<u32>,
    },
    #[error("executor is not accepting work (state: {0:?})")]
    NotRunning(ExecutorState),
    #[error("partition {partition_id} out of range [0, {partition_count})")]
    InvalidPartition {
        partition_id: u32,
        partition_count: u32,
    },
    #[error("operation for partition {partition_id:?} may not run inline on thread {thread}")]
    RunNotAllowed {
        thread: String,
        partition_id: Option<u32>,
    },
    #[error("shutdown cannot be called from one of the executor's own threads")]
    ShutdownFromOperationThread,
    #[error("failed to spawn operation thread: {0}")]
    Spawn(String),
}
