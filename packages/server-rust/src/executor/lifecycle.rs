//! Executor lifecycle with in-flight submission tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for submissions that are between "passed the state check" and
//! "landed in a queue". Shutdown waits for that counter to reach zero before
//! draining queues, so no accepted item can slip in after the drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

/// Executor lifecycle state.
///
/// State machine: Starting -> Running -> ShuttingDown -> Terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Threads are being spawned; submissions are refused.
    Starting,
    /// Accepting and executing work.
    Running,
    /// No new work is accepted; threads are stopping.
    ShuttingDown,
    /// Threads have exited and queued work has been discarded.
    Terminated,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ArcSwap<ExecutorState>,
    accepting: AtomicBool,
    in_flight: Arc<AtomicU64>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(ExecutorState::Starting),
            accepting: AtomicBool::new(false),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn state(&self) -> ExecutorState {
        **self.state.load()
    }

    /// Moves `Starting` to `Running`. Returns `false` from any other state.
    pub(crate) fn set_running(&self) -> bool {
        if self.transition(ExecutorState::Starting, ExecutorState::Running) {
            self.accepting.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Registers a submission. Returns `None` once the executor stopped
    /// accepting work.
    ///
    /// The counter is raised before the flag is read, and shutdown clears the
    /// flag before reading the counter, so one of the two always sees the
    /// other.
    pub(crate) fn try_submit(&self) -> Option<SubmissionGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = SubmissionGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        self.accepting.load(Ordering::SeqCst).then_some(guard)
    }

    /// Stops accepting work. Returns `true` for the one caller that performed
    /// the transition out of `Starting` or `Running`.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            ExecutorState::Starting | ExecutorState::Running => {
                Arc::new(ExecutorState::ShuttingDown)
            }
            _ => Arc::clone(current),
        });
        let won = matches!(
            *previous,
            ExecutorState::Starting | ExecutorState::Running
        );
        if won {
            self.accepting.store(false, Ordering::SeqCst);
        }
        won
    }

    /// Whether operation threads should stop taking new work.
    pub(crate) fn is_stopping(&self) -> bool {
        matches!(
            self.state(),
            ExecutorState::ShuttingDown | ExecutorState::Terminated
        )
    }

    /// Waits for in-flight submissions to finish, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub(crate) fn wait_for_submitters(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn set_terminated(&self) {
        self.state.store(Arc::new(ExecutorState::Terminated));
    }

    pub(crate) fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        let current = self.state.load_full();
        if *current != from {
            return false;
        }
        let previous = self.state.compare_and_swap(&current, Arc::new(to));
        Arc::ptr_eq(&*previous, &current)
    }
}

/// RAII guard that decrements the in-flight counter when dropped, including
/// during unwinding.
#[derive(Debug)]
pub(crate) struct SubmissionGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
