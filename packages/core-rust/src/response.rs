//! Response wire type.
//!
//! A response carries the outcome of one invocation back to the caller,
//! correlated by call id. Payloads are MessagePack (`rmp-serde`), with result
//! values kept as dynamic `rmpv::Value`s so the executor never needs to know
//! concrete result types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::packet::Packet;

/// Coarse classification of a failed invocation, preserved across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The operation's `run` returned an error.
    Execution,
    /// The operation packet could not be decoded.
    Deserialization,
    /// The target node was shutting down before the operation started.
    ShuttingDown,
    /// The operation could not be enqueued.
    Rejected,
    /// The operation reached a runner that does not own its partition.
    WrongPartition,
    /// The operation panicked.
    Panicked,
}

/// Outcome carried by a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    Value(rmpv::Value),
    Error { kind: ErrorKind, message: String },
}

/// Reply to an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub call_id: u64,
    pub outcome: ResponseOutcome,
}

/// Errors from encoding or decoding a response payload.
#[derive(Debug, thiserror::Error)]
pub enum ResponseCodecError {
    #[error("failed to encode response: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// A failure reported by the executing side of an invocation.
///
/// This is what a caller's future fails with when the response carried an
/// error outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invocation failed ({kind:?}): {message}")]
pub struct RemoteInvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl Response {
    #[must_use]
    pub fn value(call_id: u64, value: rmpv::Value) -> Self {
        Self {
            call_id,
            outcome: ResponseOutcome::Value(value),
        }
    }

    #[must_use]
    pub fn error(call_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id,
            outcome: ResponseOutcome::Error {
                kind,
                message: message.into(),
            },
        }
    }

    /// Encodes the response as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns `ResponseCodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ResponseCodecError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// Decodes a MessagePack response.
    ///
    /// # Errors
    ///
    /// Returns `ResponseCodecError::Decode` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ResponseCodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Wraps the encoded response in a response packet.
    ///
    /// # Errors
    ///
    /// Returns `ResponseCodecError::Encode` if serialization fails.
    pub fn to_packet(&self) -> Result<Packet, ResponseCodecError> {
        Ok(Packet::response(self.call_id, self.encode()?))
    }

    /// Converts the outcome into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the error outcome as a `RemoteInvocationError`.
    pub fn into_result(self) -> Result<rmpv::Value, RemoteInvocationError> {
        match self.outcome {
            ResponseOutcome::Value(value) => Ok(value),
            ResponseOutcome::Error { kind, message } => {
                Err(RemoteInvocationError { kind, message })
            }
        }
    }
}
