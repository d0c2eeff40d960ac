//! Gridline Server: partition-threaded operation executor, runners and
//! invocation registry.

pub mod executor;
pub mod invocation;
pub mod operation;

pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorServices, ExecutorState, OperationExecutor, Task,
};
pub use invocation::{DefaultResponseHandler, InvocationRegistry, PacketSender, ResponseHandler};
pub use operation::{Caller, Operation, OperationCodec, OperationContext, OperationError};
