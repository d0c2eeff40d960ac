//! Operation runners.
//!
//! A runner executes one item at a time on the calling thread. Partition
//! runners are only ever driven by the thread owning their partition, generic
//! runners by their generic thread, and each ad-hoc runner by the one caller
//! thread it was created for. Runners never let a failure escape: operation errors and
//! panics are routed to the caller or logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use gridline_core::future::panic_message;
use gridline_core::{Packet, PacketKind, Response};

use super::task::{Task, Work};
use super::thread;
use crate::invocation::ResponseHandler;
use crate::operation::codec::context_from_header;
use crate::operation::{Operation, OperationCodec, OperationContext, OperationError};

/// Which slot a runner occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    Partition(u32),
    Generic(usize),
    AdHoc,
}

/// What a runner is executing right now.
#[derive(Debug, Clone)]
pub struct CurrentTask {
    /// Operation kind, `"task"` or `"response"`.
    pub description: String,
    pub partition_id: Option<u32>,
    pub call_id: Option<u64>,
    pub started_at: Instant,
}

impl CurrentTask {
    fn new(
        description: impl Into<String>,
        partition_id: Option<u32>,
        call_id: Option<u64>,
    ) -> Self {
        Self {
            description: description.into(),
            partition_id,
            call_id,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Point-in-time view of a busy runner.
#[derive(Debug, Clone)]
pub struct RunnerSnapshot {
    pub runner: RunnerKind,
    pub task: Arc<CurrentTask>,
}

pub struct OperationRunner {
    kind: RunnerKind,
    current: ArcSwapOption<CurrentTask>,
    executed: AtomicU64,
    responses: Arc<dyn ResponseHandler>,
    codec: Arc<OperationCodec>,
}

impl OperationRunner {
    pub(crate) fn new(
        kind: RunnerKind,
        responses: Arc<dyn ResponseHandler>,
        codec: Arc<OperationCodec>,
    ) -> Self {
        Self {
            kind,
            current: ArcSwapOption::empty(),
            executed: AtomicU64::new(0),
            responses,
            codec,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RunnerKind {
        self.kind
    }

    /// The item being executed, `None` when idle.
    #[must_use]
    pub fn current_task(&self) -> Option<Arc<CurrentTask>> {
        self.current.load_full()
    }

    /// Number of items this runner has finished, successfully or not.
    #[must_use]
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn run(self: &Arc<Self>, work: Work) {
        match work {
            Work::Operation(op) => self.run_operation(op),
            Work::Packet(packet) => self.run_packet(packet),
            Work::Task(task) => self.run_task(task),
        }
    }

    /// Runs a raw task inline. A failing or panicking task is logged.
    pub fn run_task(self: &Arc<Self>, task: Task) {
        let _scope = self.enter(CurrentTask::new("task", task.partition_id(), None));
        if let Some(partition_id) = task.partition_id() {
            if let Err(reason) = self.check_ownership(partition_id) {
                tracing::error!(runner = ?self.kind, partition_id, "task reached the wrong runner");
                task.discard(Arc::new(reason));
                return;
            }
        }
        execute_guarded(task);
        self.finished();
    }

    /// Runs an operation inline and routes its outcome.
    pub fn run_operation(self: &Arc<Self>, mut op: Box<dyn Operation>) {
        let ctx = op.ctx().clone();
        let _scope = self.enter(CurrentTask::new(op.kind(), ctx.partition_id, ctx.call_id));

        let outcome = match ctx.partition_id.map(|p| self.check_ownership(p)) {
            Some(Err(reason)) => Err(reason),
            _ => catch_unwind(AssertUnwindSafe(|| op.run())).unwrap_or_else(|payload| {
                Err(OperationError::Panicked(panic_message(payload.as_ref())))
            }),
        };

        self.finished();
        self.route_outcome(op.kind(), &ctx, outcome);
    }

    /// Decodes and runs an operation packet, or delivers a response packet.
    pub fn run_packet(self: &Arc<Self>, packet: Packet) {
        match packet.kind() {
            PacketKind::Response => {
                let current = CurrentTask::new("response", None, Some(packet.call_id()));
                let _scope = self.enter(current);
                match Response::decode(packet.payload()) {
                    Ok(response) => self.responses.on_response(response),
                    Err(err) => {
                        tracing::warn!(
                            call_id = packet.call_id(),
                            error = %err,
                            "dropping malformed response"
                        );
                    }
                }
                self.finished();
            }
            PacketKind::Operation => match self.codec.decode(&packet) {
                Ok(op) => self.run_operation(op),
                Err(err) => {
                    let ctx = context_from_header(&packet);
                    tracing::warn!(
                        runner = ?self.kind,
                        call_id = ?ctx.call_id,
                        error = %err,
                        "failed to decode operation packet"
                    );
                    metrics::counter!("gridline_operations_failed_total").increment(1);
                    if ctx.expects_reply() {
                        let reason = OperationError::Deserialization(err.to_string());
                        self.responses.send_response(&ctx, Err(reason));
                    }
                    self.executed.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    fn route_outcome(
        &self,
        kind: &str,
        ctx: &OperationContext,
        outcome: Result<rmpv::Value, OperationError>,
    ) {
        if let Err(err) = &outcome {
            metrics::counter!("gridline_operations_failed_total").increment(1);
            if !ctx.expects_reply() {
                tracing::warn!(
                    runner = ?self.kind,
                    operation = kind,
                    partition_id = ?ctx.partition_id,
                    error = %err,
                    "operation failed with no caller waiting"
                );
                return;
            }
            tracing::debug!(
                operation = kind,
                call_id = ?ctx.call_id,
                error = %err,
                "operation failed"
            );
        }
        if ctx.expects_reply() {
            self.responses.send_response(ctx, outcome);
        }
    }

    /// Partition-specific work may only run on the runner of that partition.
    /// Generic work may run anywhere.
    fn check_ownership(&self, partition_id: u32) -> Result<(), OperationError> {
        match self.kind {
            RunnerKind::Partition(owned) if owned == partition_id => Ok(()),
            _ => Err(OperationError::WrongPartition { partition_id }),
        }
    }

    fn finished(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gridline_operations_executed_total").increment(1);
    }

    fn enter(self: &Arc<Self>, task: CurrentTask) -> RunnerScope<'_> {
        let installed = Some(Arc::new(task));
        let previous_task = self.current.swap(installed.clone());
        let previous_runner = thread::replace_current_runner(Some(Arc::clone(self)));
        RunnerScope {
            runner: self,
            installed,
            previous_task,
            previous_runner,
        }
    }
}

impl std::fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRunner")
            .field("kind", &self.kind)
            .field("busy", &self.current.load().is_some())
            .field("executed", &self.executed_count())
            .finish_non_exhaustive()
    }
}

/// Restores the runner's previous task and the thread's previous runner, so
/// nested inline runs unwind cleanly.
///
/// The task slot is only restored while it still holds the task this scope
/// installed.
struct RunnerScope<'a> {
    runner: &'a OperationRunner,
    installed: Option<Arc<CurrentTask>>,
    previous_task: Option<Arc<CurrentTask>>,
    previous_runner: Option<Arc<OperationRunner>>,
}

impl Drop for RunnerScope<'_> {
    fn drop(&mut self) {
        let previous = self
            .runner
            .current
            .compare_and_swap(&self.installed, self.previous_task.take());
        if !same_task((*previous).as_ref(), self.installed.as_ref()) {
            tracing::error!(
                runner = ?self.runner.kind,
                "runner task slot changed under a running scope"
            );
        }
        thread::replace_current_runner(self.previous_runner.take());
    }
}

fn same_task(a: Option<&Arc<CurrentTask>>, b: Option<&Arc<CurrentTask>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Runs `task`, logging instead of propagating failures and panics.
fn execute_guarded(task: Task) {
    let partition_id = task.partition_id();
    let completion = task.completion().cloned();
    match catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            metrics::counter!("gridline_operations_failed_total").increment(1);
            tracing::warn!(partition_id = ?partition_id, error = %err, "task failed");
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            metrics::counter!("gridline_operations_failed_total").increment(1);
            tracing::error!(partition_id = ?partition_id, panic = %message, "task panicked");
            if let Some(completion) = completion {
                completion.fail(OperationError::Panicked(message));
            }
        }
    }
}

/// Runs a task that is not bound to any runner, such as a broadcast to every
/// partition thread.
pub(crate) fn run_unscoped(task: Task) {
    execute_guarded(task);
    metrics::counter!("gridline_operations_executed_total").increment(1);
}

/// All runners of one executor.
///
/// Ad-hoc runners are created per calling thread on first use and dropped
/// again once that thread's outermost inline run returns.
pub(crate) struct Runners {
    partition: Vec<Arc<OperationRunner>>,
    generic: Vec<Arc<OperationRunner>>,
    ad_hoc: DashMap<ThreadId, Arc<OperationRunner>>,
    retired_ad_hoc_executed: AtomicU64,
    responses: Arc<dyn ResponseHandler>,
    codec: Arc<OperationCodec>,
}

impl Runners {
    pub(crate) fn new(
        partition_count: u32,
        generic_count: usize,
        responses: &Arc<dyn ResponseHandler>,
        codec: &Arc<OperationCodec>,
    ) -> Self {
        let make = |kind| {
            Arc::new(OperationRunner::new(
                kind,
                Arc::clone(responses),
                Arc::clone(codec),
            ))
        };
        Self {
            partition: (0..partition_count)
                .map(|p| make(RunnerKind::Partition(p)))
                .collect(),
            generic: (0..generic_count)
                .map(|i| make(RunnerKind::Generic(i)))
                .collect(),
            ad_hoc: DashMap::new(),
            retired_ad_hoc_executed: AtomicU64::new(0),
            responses: Arc::clone(responses),
            codec: Arc::clone(codec),
        }
    }

    pub(crate) fn partition(&self, partition_id: u32) -> Option<&Arc<OperationRunner>> {
        usize::try_from(partition_id)
            .ok()
            .and_then(|index| self.partition.get(index))
    }

    pub(crate) fn generic(&self, index: usize) -> Option<&Arc<OperationRunner>> {
        self.generic.get(index)
    }

    /// The calling thread's ad-hoc runner, created on first use.
    pub(crate) fn ad_hoc(&self) -> Arc<OperationRunner> {
        let runner = self
            .ad_hoc
            .entry(std::thread::current().id())
            .or_insert_with(|| {
                Arc::new(OperationRunner::new(
                    RunnerKind::AdHoc,
                    Arc::clone(&self.responses),
                    Arc::clone(&self.codec),
                ))
            });
        Arc::clone(runner.value())
    }

    /// Drops the calling thread's ad-hoc runner if `runner` is it and it is
    /// idle. Its executed count is kept.
    pub(crate) fn release_ad_hoc(&self, runner: &Arc<OperationRunner>) {
        let removed = self
            .ad_hoc
            .remove_if(&std::thread::current().id(), |_, installed| {
                Arc::ptr_eq(installed, runner) && installed.current_task().is_none()
            });
        if let Some((_, retired)) = removed {
            self.retired_ad_hoc_executed
                .fetch_add(retired.executed_count(), Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn ad_hoc_count(&self) -> usize {
        self.ad_hoc.len()
    }

    #[cfg(test)]
    pub(crate) fn partition_runners(&self) -> &[Arc<OperationRunner>] {
        &self.partition
    }

    #[cfg(test)]
    pub(crate) fn generic_runners(&self) -> &[Arc<OperationRunner>] {
        &self.generic
    }

    pub(crate) fn responses(&self) -> &dyn ResponseHandler {
        self.responses.as_ref()
    }

    pub(crate) fn all(&self) -> Vec<Arc<OperationRunner>> {
        let ad_hoc: Vec<_> = self.ad_hoc.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.partition
            .iter()
            .chain(self.generic.iter())
            .cloned()
            .chain(ad_hoc)
            .collect()
    }

    /// Items finished by every runner, including retired ad-hoc runners.
    pub(crate) fn executed_count(&self) -> u64 {
        self.retired_ad_hoc_executed.load(Ordering::Relaxed)
            + self
                .all()
                .iter()
                .map(|runner| runner.executed_count())
                .sum::<u64>()
    }

    /// Busy runners with what they are executing.
    pub(crate) fn snapshots(&self) -> Vec<RunnerSnapshot> {
        self.all()
            .into_iter()
            .filter_map(|runner| {
                runner.current_task().map(|task| RunnerSnapshot {
                    runner: runner.kind(),
                    task,
                })
            })
            .collect()
    }
}
