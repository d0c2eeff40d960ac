//! Operation contract executed by the runners.
//!
//! An operation is a unit of work that either targets one partition or is
//! generic. It carries an [`OperationContext`] with its routing and reply
//! metadata and produces a dynamic `rmpv::Value` result.

pub mod codec;

use std::sync::Arc;

use gridline_core::{Cause, ErrorKind};

pub use codec::{CodecError, OperationCodec};

/// Who is waiting for the operation's result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Caller {
    /// A future registered in this node's invocation registry.
    #[default]
    Local,
    /// Another node, identified by its node id.
    Remote(String),
}

/// Routing and reply metadata carried with every operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationContext {
    /// Correlates the reply with the caller. `None` means fire-and-forget.
    pub call_id: Option<u64>,
    /// Target partition, `None` for generic operations.
    pub partition_id: Option<u32>,
    /// Urgent operations overtake normal ones in the same queue.
    pub urgent: bool,
    pub caller: Caller,
}

impl OperationContext {
    /// Context for a generic, fire-and-forget operation.
    #[must_use]
    pub fn generic() -> Self {
        Self::default()
    }

    /// Context for a fire-and-forget operation on `partition_id`.
    #[must_use]
    pub fn partition(partition_id: u32) -> Self {
        Self {
            partition_id: Some(partition_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = Some(call_id);
        self
    }

    #[must_use]
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }

    /// Whether a reply must be routed back to a caller.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.call_id.is_some()
    }

    #[must_use]
    pub fn is_partition_specific(&self) -> bool {
        self.partition_id.is_some()
    }
}

/// Errors an operation run can end with.
///
/// `Execution` wraps whatever the operation itself returned. Local callers
/// receive that exact cause; every other variant reaches them as an
/// `OperationError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Execution(Cause),
    #[error("operation panicked: {0}")]
    Panicked(String),
    #[error("partition {partition_id} is not owned by this runner")]
    WrongPartition { partition_id: u32 },
    #[error("node is shutting down")]
    ShuttingDown,
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("failed to decode operation: {0}")]
    Deserialization(String),
}

impl OperationError {
    /// Wraps an operation's own failure, keeping the error instance intact.
    pub fn execution<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Execution(Arc::new(error))
    }

    /// The cause a local caller's future fails with.
    #[must_use]
    pub fn into_cause(self) -> Cause {
        match self {
            Self::Execution(cause) => cause,
            other => Arc::new(other),
        }
    }

    /// Wire classification used when the caller is remote.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Execution(_) => ErrorKind::Execution,
            Self::Panicked(_) => ErrorKind::Panicked,
            Self::WrongPartition { .. } => ErrorKind::WrongPartition,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Deserialization(_) => ErrorKind::Deserialization,
        }
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(error: anyhow::Error) -> Self {
        Self::Execution(anyhow_cause(error))
    }
}

/// Converts an `anyhow` error into a shareable [`Cause`].
#[must_use]
pub fn anyhow_cause(error: anyhow::Error) -> Cause {
    Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(error))
}

/// A unit of work run by an operation runner.
pub trait Operation: Send + 'static {
    fn ctx(&self) -> &OperationContext;

    fn ctx_mut(&mut self) -> &mut OperationContext;

    /// Executes the operation. Runs on exactly one runner thread.
    ///
    /// # Errors
    ///
    /// Any error is routed to the caller when a reply is expected, and logged
    /// otherwise.
    fn run(&mut self) -> Result<rmpv::Value, OperationError>;

    /// Stable identifier used by [`OperationCodec`] to find a decoder.
    fn kind(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Serializes the operation's own fields for transport.
    ///
    /// # Errors
    ///
    /// The default returns `CodecError::NotSerializable`; operations that
    /// travel between nodes override it, usually with [`codec::encode_body`].
    fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::NotSerializable {
            kind: self.kind().to_string(),
        })
    }
}

impl std::fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind())
            .field("ctx", self.ctx())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    struct Noop(OperationContext);

    impl Operation for Noop {
        fn ctx(&self) -> &OperationContext {
            &self.0
        }

        fn ctx_mut(&mut self) -> &mut OperationContext {
            &mut self.0
        }

        fn run(&mut self) -> Result<rmpv::Value, OperationError> {
            Ok(rmpv::Value::Nil)
        }
    }

    #[test]
    fn context_builders() {
        let ctx = OperationContext::partition(7)
            .with_call_id(3)
            .with_urgent(true)
            .with_caller(Caller::Remote("node-b".to_string()));
        assert_eq!(ctx.partition_id, Some(7));
        assert!(ctx.expects_reply());
        assert!(ctx.urgent);
        assert!(ctx.is_partition_specific());

        let generic = OperationContext::generic();
        assert!(!generic.expects_reply());
        assert!(!generic.is_partition_specific());
        assert_eq!(generic.caller, Caller::Local);
    }

    #[test]
    fn execution_cause_keeps_identity() {
        let cause: Cause = Arc::new(DiskFull);
        let err = OperationError::Execution(Arc::clone(&cause));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(Arc::ptr_eq(&err.into_cause(), &cause));
    }

    #[test]
    fn non_execution_errors_become_their_own_cause() {
        let cause = OperationError::ShuttingDown.into_cause();
        assert!(matches!(
            cause.downcast_ref::<OperationError>(),
            Some(OperationError::ShuttingDown)
        ));
    }

    #[test]
    fn anyhow_errors_keep_their_message() {
        let err: OperationError = anyhow::anyhow!("bad input").into();
        assert_eq!(err.to_string(), "bad input");
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[test]
    fn default_kind_and_body() {
        let op = Noop(OperationContext::generic());
        assert!(op.kind().ends_with("Noop"));
        assert!(matches!(
            op.encode_body(),
            Err(CodecError::NotSerializable { .. })
        ));
        let boxed: Box<dyn Operation> = Box::new(op);
        assert!(format!("{boxed:?}").contains("Noop"));
    }
}
