//! Operation threads and the thread-local identity they carry.
//!
//! Each operation thread records which executor it belongs to and whether it
//! is a partition or generic thread. The executor reads this to decide whether
//! an operation may run inline on the calling thread.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crossbeam_utils::sync::Parker;

use super::lifecycle::Lifecycle;
use super::queue::OperationQueue;
use super::runner::{run_unscoped, OperationRunner, Runners};
use super::task::Work;
use crate::operation::OperationError;

/// What kind of thread the caller is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Partition thread `index` of executor `executor`.
    Partition { executor: u64, index: usize },
    /// Generic thread `index` of executor `executor`.
    Generic { executor: u64, index: usize },
    /// A thread that must never run operations inline.
    Hostile,
}

thread_local! {
    static ROLE: Cell<Option<ThreadRole>> = const { Cell::new(None) };
    static CURRENT_RUNNER: RefCell<Option<Arc<OperationRunner>>> = const { RefCell::new(None) };
}

/// Role of the calling thread, `None` for threads the executor does not know.
#[must_use]
pub fn current_role() -> Option<ThreadRole> {
    ROLE.with(Cell::get)
}

/// Marks the calling thread as hostile: operations are never run inline on it
/// and it may not wait on invocations that need an operation thread.
pub fn mark_operation_hostile() {
    ROLE.with(|role| role.set(Some(ThreadRole::Hostile)));
}

pub(crate) fn set_role(role: ThreadRole) {
    ROLE.with(|cell| cell.set(Some(role)));
}

/// The runner executing on the calling thread right now, if any.
pub(crate) fn current_runner() -> Option<Arc<OperationRunner>> {
    CURRENT_RUNNER.with(|cell| cell.borrow().clone())
}

/// Installs `runner` as the calling thread's current runner, returning the
/// previous one.
pub(crate) fn replace_current_runner(
    runner: Option<Arc<OperationRunner>>,
) -> Option<Arc<OperationRunner>> {
    CURRENT_RUNNER.with(|cell| cell.replace(runner))
}

/// Body of one operation thread.
pub(crate) struct OperationThread {
    pub(crate) role: ThreadRole,
    pub(crate) queue: Arc<OperationQueue>,
    pub(crate) parker: Parker,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) runners: Arc<Runners>,
}

impl OperationThread {
    pub(crate) fn run(self) {
        set_role(self.role);
        tracing::debug!(role = ?self.role, "operation thread started");

        while !self.lifecycle.is_stopping() {
            match self.queue.poll() {
                Some(work) => self.dispatch(work),
                None => self.parker.park(),
            }
        }

        tracing::debug!(role = ?self.role, "operation thread stopped");
    }

    fn dispatch(&self, work: Work) {
        match (self.role, work.partition_id()) {
            (ThreadRole::Partition { .. }, Some(partition_id)) => {
                match self.runners.partition(partition_id) {
                    Some(runner) => runner.run(work),
                    None => self.misrouted(work),
                }
            }
            (ThreadRole::Partition { .. }, None) => match work {
                Work::Task(task) => run_unscoped(task),
                other => self.misrouted(other),
            },
            (ThreadRole::Generic { index, .. }, None) => match self.runners.generic(index) {
                Some(runner) => runner.run(work),
                None => self.misrouted(work),
            },
            _ => self.misrouted(work),
        }
    }

    fn misrouted(&self, work: Work) {
        tracing::error!(
            role = ?self.role,
            partition_id = ?work.partition_id(),
            "work reached a thread that cannot run it"
        );
        let reason = OperationError::Rejected(format!("misrouted to {:?}", self.role));
        work.discard(&reason, self.runners.responses());
    }
}
