//! Items carried by the executor queues.

use std::fmt;

use gridline_core::{Cause, InvocationFuture, Packet, PacketKind, Response};

use crate::invocation::ResponseHandler;
use crate::operation::codec::context_from_header;
use crate::operation::{anyhow_cause, Operation, OperationError};

type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// A raw closure scheduled on an operation thread.
///
/// A task with a partition id runs on that partition's runner, one without
/// runs on whichever thread it was queued to. A tracked task completes its
/// future with the closure's outcome.
pub struct Task {
    partition_id: Option<u32>,
    urgent: bool,
    body: TaskBody,
    completion: Option<InvocationFuture<()>>,
}

impl Task {
    /// A generic task.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            partition_id: None,
            urgent: false,
            body: Box::new(body),
            completion: None,
        }
    }

    /// A task that runs on the runner owning `partition_id`.
    pub fn for_partition<F>(partition_id: u32, body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            partition_id: Some(partition_id),
            ..Self::new(body)
        }
    }

    /// Attaches a completion future to this task.
    #[must_use]
    pub fn tracked(mut self) -> (Self, InvocationFuture<()>) {
        let future = InvocationFuture::new();
        self.completion = Some(future.clone());
        (self, future)
    }

    #[must_use]
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    #[must_use]
    pub fn partition_id(&self) -> Option<u32> {
        self.partition_id
    }

    #[must_use]
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    /// Runs the body on the calling thread and completes the tracked future.
    /// Panics propagate; the caller catches them and fails the future itself.
    ///
    /// A failing body's error becomes the future's cause as is; the returned
    /// message carries its full context chain for logging.
    pub(crate) fn run(self) -> Result<(), String> {
        let Self {
            body, completion, ..
        } = self;
        match (body(), completion) {
            (Ok(()), Some(completion)) => {
                completion.complete(());
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(err), Some(completion)) => {
                let message = format!("{err:#}");
                completion.complete_exceptionally(anyhow_cause(err));
                Err(message)
            }
            (Err(err), None) => Err(format!("{err:#}")),
        }
    }

    /// Drops the task without running it, failing its completion future.
    pub(crate) fn discard(self, cause: Cause) {
        if let Some(completion) = self.completion {
            completion.complete_exceptionally(cause);
        }
    }

    pub(crate) fn completion(&self) -> Option<&InvocationFuture<()>> {
        self.completion.as_ref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("partition_id", &self.partition_id)
            .field("urgent", &self.urgent)
            .field("tracked", &self.completion.is_some())
            .finish_non_exhaustive()
    }
}

/// One queued unit of work.
#[derive(Debug)]
pub(crate) enum Work {
    Operation(Box<dyn Operation>),
    Packet(Packet),
    Task(Task),
}

impl Work {
    pub(crate) fn partition_id(&self) -> Option<u32> {
        match self {
            Self::Operation(op) => op.ctx().partition_id,
            Self::Packet(packet) => packet.partition_id(),
            Self::Task(task) => task.partition_id(),
        }
    }

    pub(crate) fn is_urgent(&self) -> bool {
        match self {
            Self::Operation(op) => op.ctx().urgent,
            Self::Packet(packet) => packet.is_urgent(),
            Self::Task(task) => task.is_urgent(),
        }
    }

    /// Drops the work without running it, telling any waiter why.
    ///
    /// Response packets carry no partition state and are still delivered.
    pub(crate) fn discard(self, reason: &OperationError, responses: &dyn ResponseHandler) {
        match self {
            Self::Operation(op) => {
                if op.ctx().expects_reply() {
                    responses.send_response(op.ctx(), Err(reason.clone()));
                }
            }
            Self::Packet(packet) => match packet.kind() {
                PacketKind::Operation => {
                    let ctx = context_from_header(&packet);
                    if ctx.expects_reply() {
                        responses.send_response(&ctx, Err(reason.clone()));
                    }
                }
                PacketKind::Response => match Response::decode(packet.payload()) {
                    Ok(response) => responses.on_response(response),
                    Err(err) => {
                        tracing::warn!(
                            call_id = packet.call_id(),
                            error = %err,
                            "dropping malformed response"
                        );
                    }
                },
            },
            Self::Task(task) => task.discard(std::sync::Arc::new(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_task_completes_future() {
        let (task, future) = Task::new(|| Ok(())).tracked();
        assert!(task.completion().is_some());
        task.run().unwrap();
        assert!(future.join().is_ok());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("segment {0} is sealed")]
    struct SegmentSealed(u32);

    #[test]
    fn failing_task_fails_future_and_returns_error() {
        let (task, future) = Task::for_partition(4, || anyhow::bail!("no space left")).tracked();
        assert_eq!(task.partition_id(), Some(4));
        let err = task.run().unwrap_err();
        assert_eq!(err, "no space left");
        let cause = future.join().unwrap_err();
        assert_eq!(cause.cause().unwrap().to_string(), "no space left");
    }

    #[test]
    fn task_error_reaches_future_as_original_type() {
        let (task, future) = Task::new(|| Err(SegmentSealed(9).into())).tracked();
        assert_eq!(task.run().unwrap_err(), "segment 9 is sealed");
        let err = future.join().unwrap_err();
        let sealed = err.cause().unwrap().downcast_ref::<SegmentSealed>();
        assert_eq!(sealed.map(|s| s.0), Some(9));
    }

    #[test]
    fn untracked_task_error_keeps_context_chain() {
        use anyhow::Context;
        let task = Task::new(|| Err(SegmentSealed(3)).context("compacting"));
        assert_eq!(task.run().unwrap_err(), "compacting: segment 3 is sealed");
    }

    #[test]
    fn discarded_task_never_runs() {
        let (task, future) = Task::new(|| panic!("must not run")).tracked();
        task.discard(std::sync::Arc::new(OperationError::ShuttingDown));
        let err = future.get().unwrap_err();
        assert!(matches!(
            err.cause().unwrap().downcast_ref::<OperationError>(),
            Some(OperationError::ShuttingDown)
        ));
    }

    #[test]
    fn work_reports_routing_fields() {
        let task = Work::Task(Task::for_partition(2, || Ok(())).with_urgent(true));
        assert_eq!(task.partition_id(), Some(2));
        assert!(task.is_urgent());

        let packet = Work::Packet(Packet::operation(None, 0, bytes::Bytes::new()));
        assert_eq!(packet.partition_id(), None);
        assert!(!packet.is_urgent());
    }
}
