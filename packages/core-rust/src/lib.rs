//! Gridline Core: invocation futures, packets, responses and partition ownership.
//!
//! These are the leaf types shared by the operation executor and by the
//! networking layer that feeds it.

pub mod future;
pub mod interrupt;
pub mod packet;
pub mod partition;
pub mod response;

pub use future::{Cause, CompletionError, GetError, InvocationFuture, PanicError};
pub use interrupt::InterruptHandle;
pub use packet::{Packet, PacketError, PacketKind};
pub use partition::{DEFAULT_PARTITION_COUNT, GENERIC_PARTITION_ID};
pub use response::{ErrorKind, RemoteInvocationError, Response, ResponseOutcome};
