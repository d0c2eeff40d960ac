//! The operation executor.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::Parker;
use gridline_core::partition::partition_thread_index;
use gridline_core::{Cause, InvocationFuture, Packet};
use parking_lot::Mutex;

use super::config::ExecutorConfig;
use super::lifecycle::{ExecutorState, Lifecycle};
use super::monitor::{BackgroundWorker, SlowOperationDetector};
use super::queue::{Lane, OperationQueue};
use super::runner::{OperationRunner, RunnerKind, RunnerSnapshot, Runners};
use super::task::{Task, Work};
use super::thread::{self, OperationThread, ThreadRole};
use super::ExecutorError;
use crate::invocation::{DefaultResponseHandler, InvocationRegistry, PacketSender, ResponseHandler};
use crate::operation::{Caller, Operation, OperationCodec, OperationContext, OperationError};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// ExecutorServices
// ---------------------------------------------------------------------------

/// Collaborators the executor and its runners share.
#[derive(Clone)]
pub struct ExecutorServices {
    pub codec: Arc<OperationCodec>,
    pub registry: Arc<InvocationRegistry>,
    pub responses: Arc<dyn ResponseHandler>,
}

impl ExecutorServices {
    /// Services with a fresh registry and a [`DefaultResponseHandler`] that
    /// has no outbound networking.
    #[must_use]
    pub fn new(codec: Arc<OperationCodec>) -> Self {
        let registry = Arc::new(InvocationRegistry::new());
        let responses = Arc::new(DefaultResponseHandler::new(Arc::clone(&registry)));
        Self {
            codec,
            registry,
            responses,
        }
    }

    /// Sends responses for remote callers through `outbound`.
    #[must_use]
    pub fn with_packet_sender(mut self, outbound: Arc<dyn PacketSender>) -> Self {
        self.responses = Arc::new(
            DefaultResponseHandler::new(Arc::clone(&self.registry)).with_packet_sender(outbound),
        );
        self
    }

    /// Replaces the response handler entirely.
    #[must_use]
    pub fn with_response_handler(mut self, responses: Arc<dyn ResponseHandler>) -> Self {
        self.responses = responses;
        self
    }
}

impl Default for ExecutorServices {
    fn default() -> Self {
        Self::new(Arc::new(OperationCodec::new()))
    }
}

impl std::fmt::Debug for ExecutorServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorServices")
            .field("codec", &self.codec)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OperationExecutor
// ---------------------------------------------------------------------------

/// Routes operations, packets and tasks to partition and generic threads.
///
/// Partition `p` belongs to partition thread `p % partition_thread_count` for
/// the executor's whole lifetime, and only that thread ever runs the runner of
/// `p`. Submitting never blocks: a full lane rejects the work instead.
///
/// Work refused at submission is also discarded the same way shutdown
/// discards queued work: a caller waiting on a reply gets an error response
/// and a tracked task's future fails.
pub struct OperationExecutor {
    id: u64,
    config: ExecutorConfig,
    services: ExecutorServices,
    runners: Arc<Runners>,
    partition_queues: Vec<Arc<OperationQueue>>,
    generic_queues: Vec<Arc<OperationQueue>>,
    next_generic: AtomicUsize,
    lifecycle: Arc<Lifecycle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationExecutor {
    /// Validates `config`, creates all runners and starts the threads.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::InvalidConfig` for an unusable configuration
    /// and `ExecutorError::Spawn` if a thread cannot be started. Threads
    /// started before the failure are stopped again.
    pub fn start(
        config: ExecutorConfig,
        services: ExecutorServices,
    ) -> Result<Self, ExecutorError> {
        config.validate()?;

        let runners = Arc::new(Runners::new(
            config.partition_count,
            config.generic_thread_count,
            &services.responses,
            &services.codec,
        ));
        let (partition_queues, partition_parkers) = queues(config.partition_thread_count, &config);
        let (generic_queues, generic_parkers) = queues(config.generic_thread_count, &config);

        let executor = Self {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            config,
            services,
            runners,
            partition_queues,
            generic_queues,
            next_generic: AtomicUsize::new(0),
            lifecycle: Arc::new(Lifecycle::new()),
            threads: Mutex::new(Vec::new()),
        };
        executor.spawn_threads(partition_parkers, generic_parkers)?;
        executor.lifecycle.set_running();

        tracing::info!(
            node_id = %executor.config.node_id,
            partitions = executor.config.partition_count,
            partition_threads = executor.config.partition_thread_count,
            generic_threads = executor.config.generic_thread_count,
            "operation executor started"
        );
        Ok(executor)
    }

    fn spawn_threads(
        &self,
        partition_parkers: Vec<Parker>,
        generic_parkers: Vec<Parker>,
    ) -> Result<(), ExecutorError> {
        let prefix = self.config.thread_name_prefix();
        let partition = partition_parkers
            .into_iter()
            .zip(&self.partition_queues)
            .enumerate()
            .map(|(index, (parker, queue))| {
                let role = ThreadRole::Partition {
                    executor: self.id,
                    index,
                };
                (format!("{prefix}.partition-thread-{index}"), role, parker, queue)
            });
        let generic = generic_parkers
            .into_iter()
            .zip(&self.generic_queues)
            .enumerate()
            .map(|(index, (parker, queue))| {
                let role = ThreadRole::Generic {
                    executor: self.id,
                    index,
                };
                (format!("{prefix}.generic-thread-{index}"), role, parker, queue)
            });

        let mut threads = self.threads.lock();
        for (name, role, parker, queue) in partition.chain(generic) {
            let worker = OperationThread {
                role,
                queue: Arc::clone(queue),
                parker,
                lifecycle: Arc::clone(&self.lifecycle),
                runners: Arc::clone(&self.runners),
            };
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|err| ExecutorError::Spawn(format!("{name}: {err}")))?;
            threads.push(handle);
        }
        Ok(())
    }

    // --- Submission ---

    /// Queues an operation on the thread that owns its partition, or on a
    /// generic thread.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::Rejected` if the target lane is full,
    /// `ExecutorError::NotRunning` outside the `Running` state, or
    /// `ExecutorError::InvalidPartition` for an out-of-range partition.
    pub fn execute(&self, op: Box<dyn Operation>) -> Result<(), ExecutorError> {
        self.submit(Work::Operation(op))
    }

    /// Queues a serialized operation or response. Routing reads only the
    /// packet header; the payload is decoded later by the runner.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_packet(&self, packet: Packet) -> Result<(), ExecutorError> {
        self.submit(Work::Packet(packet))
    }

    /// Queues a raw task on its partition's thread, or a generic thread.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_task(&self, task: Task) -> Result<(), ExecutorError> {
        self.submit(Work::Task(task))
    }

    /// Registers a local invocation for `op` and queues it.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute). The registration is dropped again
    /// on error.
    pub fn invoke(
        &self,
        mut op: Box<dyn Operation>,
    ) -> Result<InvocationFuture<rmpv::Value>, ExecutorError> {
        let (call_id, future) = self.services.registry.register();
        let ctx = op.ctx_mut();
        ctx.call_id = Some(call_id);
        ctx.caller = Caller::Local;
        if let Err(err) = self.execute(op) {
            self.services.registry.deregister(call_id);
            return Err(err);
        }
        Ok(future)
    }

    /// Runs `f` once on every partition thread, on the urgent lane.
    ///
    /// Returns one future per thread. A thread that could not accept the task
    /// has its future failed immediately.
    pub fn execute_on_partition_threads<F>(&self, f: F) -> Vec<InvocationFuture<()>>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.broadcast(&self.partition_queues, Arc::new(f))
    }

    /// Runs `f` once on every generic thread, on the urgent lane.
    pub fn execute_on_generic_threads<F>(&self, f: F) -> Vec<InvocationFuture<()>>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.broadcast(&self.generic_queues, Arc::new(f))
    }

    /// Runs `f(p)` on the runner of each partition `p` in `partitions`.
    ///
    /// Returns one future per partition, in iteration order.
    pub fn execute_on_partitions<F, I>(&self, partitions: I, f: F) -> Vec<InvocationFuture<()>>
    where
        F: Fn(u32) -> anyhow::Result<()> + Send + Sync + 'static,
        I: IntoIterator<Item = u32>,
    {
        let f = Arc::new(f);
        partitions
            .into_iter()
            .map(|partition_id| {
                let f = Arc::clone(&f);
                let (task, future) =
                    Task::for_partition(partition_id, move || f(partition_id)).tracked();
                // A refused task has already failed its future.
                let _ = self.execute_task(task);
                future
            })
            .collect()
    }

    fn broadcast(
        &self,
        queues: &[Arc<OperationQueue>],
        f: Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
    ) -> Vec<InvocationFuture<()>> {
        queues
            .iter()
            .map(|queue| {
                let f = Arc::clone(&f);
                let (task, future) = Task::new(move || f()).with_urgent(true).tracked();
                let _ = self.submit_to(queue, Work::Task(task));
                future
            })
            .collect()
    }

    fn submit(&self, work: Work) -> Result<(), ExecutorError> {
        let partition_id = work.partition_id();
        match partition_id {
            Some(partition_id) if partition_id >= self.config.partition_count => {
                let err = ExecutorError::InvalidPartition {
                    partition_id,
                    partition_count: self.config.partition_count,
                };
                work.discard(
                    &OperationError::Rejected(err.to_string()),
                    self.services.responses.as_ref(),
                );
                Err(err)
            }
            Some(partition_id) => {
                let index = partition_thread_index(partition_id, self.partition_queues.len());
                self.submit_to(&self.partition_queues[index], work)
            }
            None => self.submit_to(self.next_generic_queue(), work),
        }
    }

    fn submit_to(&self, queue: &OperationQueue, work: Work) -> Result<(), ExecutorError> {
        let Some(_guard) = self.lifecycle.try_submit() else {
            let state = self.lifecycle.state();
            let reason = if self.lifecycle.is_stopping() {
                OperationError::ShuttingDown
            } else {
                OperationError::Rejected(format!("executor is {state:?}"))
            };
            work.discard(&reason, self.services.responses.as_ref());
            return Err(ExecutorError::NotRunning(state));
        };

        let partition_id = work.partition_id();
        queue.offer(work).map_err(|(lane, work)| {
            self.on_rejected(lane, partition_id);
            let err = ExecutorError::Rejected { lane, partition_id };
            work.discard(
                &OperationError::Rejected(err.to_string()),
                self.services.responses.as_ref(),
            );
            err
        })
    }

    fn on_rejected(&self, lane: Lane, partition_id: Option<u32>) {
        metrics::counter!("gridline_operations_rejected_total", "lane" => lane.as_str())
            .increment(1);
        match lane {
            Lane::Urgent => tracing::error!(
                node_id = %self.config.node_id,
                partition_id = ?partition_id,
                "urgent lane exhausted, rejecting urgent work"
            ),
            Lane::Normal => tracing::debug!(
                partition_id = ?partition_id,
                "normal lane full, rejecting work"
            ),
        }
    }

    fn next_generic_queue(&self) -> &OperationQueue {
        let index = self.next_generic.fetch_add(1, Ordering::Relaxed) % self.generic_queues.len();
        &self.generic_queues[index]
    }

    // --- Inline execution ---

    /// Whether `ctx` may run inline on the calling thread.
    ///
    /// Partition operations may only run on the thread owning their
    /// partition. Generic operations may run on any thread that is not
    /// hostile; outside the executor's own threads this also requires the
    /// ad-hoc path to be enabled.
    #[must_use]
    pub fn is_run_allowed(&self, ctx: &OperationContext) -> bool {
        match thread::current_role() {
            Some(ThreadRole::Hostile) => false,
            Some(ThreadRole::Partition { executor, index }) if executor == self.id => {
                ctx.partition_id
                    .map_or(true, |p| self.partition_thread_index(p) == Some(index))
            }
            Some(ThreadRole::Generic { executor, .. }) if executor == self.id => {
                ctx.partition_id.is_none()
            }
            _ => ctx.partition_id.is_none() && self.config.ad_hoc_enabled,
        }
    }

    /// Whether the calling thread may invoke an operation for `ctx` and wait
    /// for it.
    ///
    /// A partition thread blocking on another partition's operation could
    /// deadlock against that partition's thread, so synchronous invocations
    /// from operation threads are limited to work they could run themselves.
    #[must_use]
    pub fn is_invocation_allowed(&self, ctx: &OperationContext, is_async: bool) -> bool {
        match thread::current_role() {
            Some(ThreadRole::Hostile) => false,
            _ if is_async => true,
            Some(ThreadRole::Partition { executor, index }) if executor == self.id => ctx
                .partition_id
                .is_some_and(|p| self.partition_thread_index(p) == Some(index)),
            Some(ThreadRole::Generic { executor, .. }) if executor == self.id => {
                ctx.partition_id.is_none()
            }
            _ => true,
        }
    }

    /// Runs `op` on the calling thread.
    ///
    /// Partition operations use their partition's runner. Generic operations
    /// use the runner currently active on an operation thread, the thread's
    /// own generic runner, or the calling thread's ad-hoc runner.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::RunNotAllowed` if [`is_run_allowed`](Self::is_run_allowed)
    /// says no.
    pub fn run(&self, op: Box<dyn Operation>) -> Result<(), ExecutorError> {
        let partition_id = op.ctx().partition_id;
        let runner = self
            .is_run_allowed(op.ctx())
            .then(|| self.inline_runner(partition_id))
            .flatten()
            .ok_or_else(|| ExecutorError::RunNotAllowed {
                thread: std::thread::current()
                    .name()
                    .unwrap_or("<unnamed>")
                    .to_string(),
                partition_id,
            })?;
        runner.run_operation(op);
        if runner.kind() == RunnerKind::AdHoc {
            self.runners.release_ad_hoc(&runner);
        }
        Ok(())
    }

    /// Runs `op` inline when allowed, otherwise queues it.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn run_or_execute(&self, op: Box<dyn Operation>) -> Result<(), ExecutorError> {
        if self.is_run_allowed(op.ctx()) {
            self.run(op)
        } else {
            self.execute(op)
        }
    }

    fn inline_runner(&self, partition_id: Option<u32>) -> Option<Arc<OperationRunner>> {
        if let Some(partition_id) = partition_id {
            return self.runners.partition(partition_id).cloned();
        }
        match thread::current_role() {
            Some(ThreadRole::Partition { executor, .. }) if executor == self.id => {
                Some(thread::current_runner().unwrap_or_else(|| self.runners.ad_hoc()))
            }
            Some(ThreadRole::Generic { executor, index }) if executor == self.id => {
                thread::current_runner().or_else(|| self.runners.generic(index).cloned())
            }
            _ => Some(self.runners.ad_hoc()),
        }
    }

    // --- Diagnostics ---

    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn services(&self) -> &ExecutorServices {
        &self.services
    }

    #[must_use]
    pub fn partition_thread_count(&self) -> usize {
        self.partition_queues.len()
    }

    #[must_use]
    pub fn generic_thread_count(&self) -> usize {
        self.generic_queues.len()
    }

    /// Index of the partition thread owning `partition_id`, `None` if the
    /// partition is out of range.
    #[must_use]
    pub fn partition_thread_index(&self, partition_id: u32) -> Option<usize> {
        (partition_id < self.config.partition_count)
            .then(|| partition_thread_index(partition_id, self.partition_queues.len()))
    }

    /// Items waiting in normal lanes across all threads.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.all_queues().map(|q| q.normal_len()).sum()
    }

    /// Items waiting in urgent lanes across all threads.
    #[must_use]
    pub fn priority_queue_size(&self) -> usize {
        self.all_queues().map(|q| q.urgent_len()).sum()
    }

    /// Runners executing something right now.
    #[must_use]
    pub fn running_operation_count(&self) -> usize {
        self.runners
            .all()
            .iter()
            .filter(|runner| runner.current_task().is_some())
            .count()
    }

    /// Items finished by all runners since start.
    #[must_use]
    pub fn executed_operation_count(&self) -> u64 {
        self.runners.executed_count()
    }

    /// What every busy runner is executing.
    #[must_use]
    pub fn current_tasks(&self) -> Vec<RunnerSnapshot> {
        self.runners.snapshots()
    }

    /// Busy runners whose current item has run for at least `threshold`.
    #[must_use]
    pub fn slow_operations(&self, threshold: Duration) -> Vec<RunnerSnapshot> {
        self.runners
            .snapshots()
            .into_iter()
            .filter(|snapshot| snapshot.task.elapsed() >= threshold)
            .collect()
    }

    /// A detector over this executor's runners using the configured threshold.
    #[must_use]
    pub fn slow_operation_detector(&self) -> SlowOperationDetector {
        SlowOperationDetector::new(
            Arc::clone(&self.runners),
            self.config.slow_operation_threshold,
        )
    }

    /// Starts the slow-operation monitor on the ambient tokio runtime, ticking
    /// at the configured interval.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn start_slow_operation_monitor(&self) -> BackgroundWorker<SlowOperationDetector> {
        BackgroundWorker::start(self.slow_operation_detector(), self.config.monitor_interval)
    }

    fn all_queues(&self) -> impl Iterator<Item = &Arc<OperationQueue>> {
        self.partition_queues.iter().chain(self.generic_queues.iter())
    }

    fn is_own_thread(&self) -> bool {
        matches!(
            thread::current_role(),
            Some(ThreadRole::Partition { executor, .. } | ThreadRole::Generic { executor, .. })
                if executor == self.id
        )
    }

    // --- Shutdown ---

    /// Stops accepting work, stops the threads, and discards whatever is still
    /// queued, failing waiting callers with `OperationError::ShuttingDown`.
    ///
    /// Calling it again after it completed is a no-op. Threads that do not
    /// exit within `shutdown_timeout` are left running detached and logged.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::ShutdownFromOperationThread` when called from
    /// one of this executor's threads, which could never be joined.
    pub fn shutdown(&self) -> Result<(), ExecutorError> {
        if self.is_own_thread() {
            return Err(ExecutorError::ShutdownFromOperationThread);
        }
        if !self.lifecycle.begin_shutdown() {
            return Ok(());
        }
        tracing::info!(node_id = %self.config.node_id, "operation executor shutting down");

        let deadline = Instant::now() + self.config.shutdown_timeout;
        if !self.lifecycle.wait_for_submitters(self.config.shutdown_timeout) {
            tracing::warn!(
                in_flight = self.lifecycle.in_flight_count(),
                "submissions still in flight at shutdown"
            );
        }

        for queue in self.all_queues() {
            queue.wake();
        }
        self.join_threads(deadline);

        let reason = OperationError::ShuttingDown;
        let mut discarded = 0usize;
        for queue in self.all_queues() {
            for work in queue.drain() {
                work.discard(&reason, self.services.responses.as_ref());
                discarded += 1;
            }
        }

        let cause: Cause = Arc::new(OperationError::ShuttingDown);
        let failed = self.services.registry.fail_all(&cause);

        self.lifecycle.set_terminated();
        tracing::info!(
            node_id = %self.config.node_id,
            discarded,
            failed_invocations = failed,
            "operation executor terminated"
        );
        Ok(())
    }

    fn join_threads(&self, deadline: Instant) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        let mut pending = handles;
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(JoinHandle::is_finished);
            for handle in finished {
                if handle.join().is_err() {
                    tracing::error!("operation thread panicked");
                }
            }
            pending = running;
            if !pending.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        for handle in pending {
            tracing::error!(
                thread = handle.thread().name().unwrap_or("<unnamed>"),
                "operation thread did not stop within the shutdown timeout"
            );
        }
    }
}

impl Drop for OperationExecutor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "operation executor dropped without shutting down");
        }
    }
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("partition_threads", &self.partition_thread_count())
            .field("generic_threads", &self.generic_thread_count())
            .finish_non_exhaustive()
    }
}

fn queues(count: usize, config: &ExecutorConfig) -> (Vec<Arc<OperationQueue>>, Vec<Parker>) {
    (0..count)
        .map(|_| {
            let parker = Parker::new();
            let queue = Arc::new(OperationQueue::new(
                config.queue_capacity,
                config.urgent_capacity(),
                parker.unparker().clone(),
            ));
            (queue, parker)
        })
        .unzip()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
