//! Invocation registry and response routing.
//!
//! Local callers register an [`InvocationFuture`] under a fresh call id before
//! their operation is submitted. When the operation finishes, the runner hands
//! the outcome to a [`ResponseHandler`], which either completes the local
//! future or ships a response packet to the remote caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gridline_core::{Cause, InvocationFuture, Packet, Response};

use crate::operation::{Caller, OperationContext, OperationError};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Routes operation outcomes to whoever is waiting for them.
pub trait ResponseHandler: Send + Sync + 'static {
    /// Delivers the outcome of an operation run. Only called for contexts
    /// that expect a reply.
    fn send_response(&self, ctx: &OperationContext, outcome: Result<rmpv::Value, OperationError>);

    /// Delivers a response that arrived from another node.
    fn on_response(&self, response: Response);
}

/// Outbound side of the networking layer.
pub trait PacketSender: Send + Sync + 'static {
    /// Sends `packet` to node `target`. Returns `false` if it could not be
    /// queued for sending.
    fn send(&self, target: &str, packet: Packet) -> bool;
}

// ---------------------------------------------------------------------------
// InvocationRegistry
// ---------------------------------------------------------------------------

/// Pending local invocations keyed by call id.
///
/// Call ids start at 1; 0 is reserved on the wire for "no reply expected".
#[derive(Debug)]
pub struct InvocationRegistry {
    next_call_id: AtomicU64,
    pending: DashMap<u64, InvocationFuture<rmpv::Value>>,
}

impl InvocationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_call_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocates a call id and the future its response will complete.
    pub fn register(&self) -> (u64, InvocationFuture<rmpv::Value>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let future = InvocationFuture::new();
        self.pending.insert(call_id, future.clone());
        (call_id, future)
    }

    /// Forgets `call_id` without completing its future.
    pub fn deregister(&self, call_id: u64) -> Option<InvocationFuture<rmpv::Value>> {
        self.pending.remove(&call_id).map(|(_, future)| future)
    }

    /// Completes and removes the invocation for `call_id`.
    ///
    /// Returns `false` if no such invocation is pending.
    pub fn complete(&self, call_id: u64, outcome: Result<rmpv::Value, Cause>) -> bool {
        let Some(future) = self.deregister(call_id) else {
            return false;
        };
        match outcome {
            Ok(value) => future.complete(value),
            Err(cause) => future.complete_exceptionally(cause),
        }
    }

    /// Completes the invocation a remote response belongs to.
    pub fn notify(&self, response: Response) -> bool {
        let call_id = response.call_id;
        let outcome = response
            .into_result()
            .map_err(|err| Arc::new(err) as Cause);
        self.complete(call_id, outcome)
    }

    /// Fails every pending invocation with `cause`. Returns how many failed.
    pub fn fail_all(&self, cause: &Cause) -> usize {
        let call_ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        call_ids
            .into_iter()
            .filter(|call_id| self.complete(*call_id, Err(Arc::clone(cause))))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DefaultResponseHandler
// ---------------------------------------------------------------------------

/// Completes local futures through the registry and sends response packets to
/// remote callers.
pub struct DefaultResponseHandler {
    registry: Arc<InvocationRegistry>,
    outbound: Option<Arc<dyn PacketSender>>,
}

impl DefaultResponseHandler {
    /// Handler for a node without outbound networking. Responses for remote
    /// callers are logged and dropped.
    #[must_use]
    pub fn new(registry: Arc<InvocationRegistry>) -> Self {
        Self {
            registry,
            outbound: None,
        }
    }

    #[must_use]
    pub fn with_packet_sender(mut self, outbound: Arc<dyn PacketSender>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InvocationRegistry> {
        &self.registry
    }

    fn send_remote(&self, node: &str, response: &Response) {
        let packet = match response.to_packet() {
            Ok(packet) => packet,
            Err(err) => {
                tracing::error!(
                    call_id = response.call_id,
                    error = %err,
                    "failed to encode response"
                );
                return;
            }
        };
        match &self.outbound {
            Some(outbound) => {
                if !outbound.send(node, packet) {
                    tracing::warn!(
                        call_id = response.call_id,
                        target = node,
                        "response could not be sent"
                    );
                }
            }
            None => {
                tracing::warn!(
                    call_id = response.call_id,
                    target = node,
                    "no outbound sender configured, dropping response"
                );
            }
        }
    }
}

impl ResponseHandler for DefaultResponseHandler {
    fn send_response(&self, ctx: &OperationContext, outcome: Result<rmpv::Value, OperationError>) {
        let Some(call_id) = ctx.call_id else {
            return;
        };
        match &ctx.caller {
            Caller::Local => {
                let outcome = outcome.map_err(OperationError::into_cause);
                if !self.registry.complete(call_id, outcome) {
                    tracing::debug!(call_id, "no pending invocation for response");
                }
            }
            Caller::Remote(node) => {
                let response = match outcome {
                    Ok(value) => Response::value(call_id, value),
                    Err(err) => Response::error(call_id, err.kind(), err.to_string()),
                };
                self.send_remote(node, &response);
            }
        }
    }

    fn on_response(&self, response: Response) {
        let call_id = response.call_id;
        if !self.registry.notify(response) {
            tracing::debug!(call_id, "response for unknown or abandoned invocation");
        }
    }
}

impl std::fmt::Debug for DefaultResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultResponseHandler")
            .field("pending", &self.registry.len())
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
